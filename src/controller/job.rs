//! Job completion observation.
//!
//! Collaborator jobs (backup, data removal) carry a task-name label;
//! their completion or failure is folded back into the task's status.
//! A backup job launched immediately after stanza creation is expected
//! to fail and be retried by whoever created it.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, warn};

use crate::config::LABEL_TASK;
use crate::controller::cluster::set_task_status;
use crate::crd::{PgTask, TaskState};
use crate::watch::EventHandler;

/// Handles job events for operator-labeled jobs.
pub struct JobHandler {
    client: Client,
}

impl JobHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn observe(&self, job: &Job) {
        let Some(task_name) = job.labels().get(LABEL_TASK) else {
            return;
        };
        let namespace = job.namespace().unwrap_or_default();

        let succeeded = job
            .status
            .as_ref()
            .and_then(|s| s.succeeded)
            .unwrap_or(0);
        let failed = job.status.as_ref().and_then(|s| s.failed).unwrap_or(0);

        let (state, message) = if succeeded >= 1 {
            (
                TaskState::Completed,
                format!("job {} completed", job.name_any()),
            )
        } else if failed >= 1 {
            warn!(
                job = %job.name_any(),
                namespace = %namespace,
                task = %task_name,
                "job failed; if this was a backup against a fresh stanza, retry after a short delay"
            );
            (TaskState::Failed, format!("job {} failed", job.name_any()))
        } else {
            return;
        };

        let api: Api<PgTask> = Api::namespaced(self.client.clone(), &namespace);
        let task = match api.get_opt(task_name).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(task = %task_name, namespace = %namespace, "job references unknown task");
                return;
            }
            Err(e) => {
                error!(task = %task_name, namespace = %namespace, "error fetching task: {}", e);
                return;
            }
        };

        if let Err(e) = set_task_status(&self.client, &task, state, &message).await {
            error!(task = %task_name, namespace = %namespace, "error updating task status: {}", e);
        }
    }
}

#[async_trait]
impl EventHandler<Job> for JobHandler {
    async fn on_add(&self, obj: &Job) {
        self.observe(obj).await;
    }

    async fn on_update(&self, _old: &Job, new: &Job) {
        self.observe(new).await;
    }

    async fn on_delete(&self, obj: &Job) {
        debug!(job = %obj.name_any(), "job removed");
    }
}
