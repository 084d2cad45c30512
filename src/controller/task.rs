//! Task execution.
//!
//! Tasks are the durable work queue: provisioning, failover, restore,
//! and data removal all arrive here as PgTask resources. A task is
//! driven until it reports completion or failure; an interrupted run is
//! picked up again on the next resync, so every task action must be
//! idempotent.

use async_trait::async_trait;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info};

use crate::controller::cluster::{
    get_cluster, promote_replica, provision_cluster, remove_cluster_data, restore_cluster,
    set_task_status, RestoreProgress,
};
use crate::controller::error::{Error, Result};
use crate::crd::{
    PgTask, TaskState, TaskType, TASK_PARAM_PITR_TARGET, TASK_PARAM_TARGET,
};
use crate::watch::EventHandler;

/// Outcome of one drive of a task.
enum TaskOutcome {
    /// All work done; the task is finished.
    Completed,
    /// More work remains; the next resync drives the task again.
    InProgress,
}

/// Handles PgTask add/update/delete events.
pub struct TaskHandler {
    client: Client,
}

impl TaskHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn execute(&self, task: &PgTask) -> Result<TaskOutcome> {
        let name = task.name_any();
        let namespace = task.namespace().unwrap_or_default();

        let Some(cluster_name) = task.spec.cluster() else {
            return Err(Error::InvalidConfig(format!(
                "task {} has no cluster parameter",
                name
            )));
        };

        info!(
            task = %name,
            namespace = %namespace,
            task_type = %task.spec.task_type,
            cluster = %cluster_name,
            "executing task"
        );
        let state = task.status.as_ref().map(|s| s.state).unwrap_or_default();
        if state == TaskState::Created {
            set_task_status(&self.client, task, TaskState::Processed, "task accepted").await?;
        }

        match task.spec.task_type {
            TaskType::Provision => {
                let cluster = self.require_cluster(cluster_name, &namespace).await?;
                provision_cluster(&self.client, &cluster).await?;
                Ok(TaskOutcome::Completed)
            }
            TaskType::Failover => {
                let cluster = self.require_cluster(cluster_name, &namespace).await?;
                let Some(target) = task.spec.parameters.get(TASK_PARAM_TARGET) else {
                    return Err(Error::InvalidConfig(format!(
                        "failover task {} has no target parameter",
                        name
                    )));
                };
                promote_replica(&self.client, &cluster, target).await?;
                Ok(TaskOutcome::Completed)
            }
            TaskType::Restore => {
                let cluster = self.require_cluster(cluster_name, &namespace).await?;
                let pitr = task
                    .spec
                    .parameters
                    .get(TASK_PARAM_PITR_TARGET)
                    .map(String::as_str);
                match restore_cluster(&self.client, &cluster, pitr).await? {
                    RestoreProgress::Submitted => Ok(TaskOutcome::Completed),
                    RestoreProgress::PrimaryRemoved => Ok(TaskOutcome::InProgress),
                }
            }
            TaskType::RemoveData => {
                remove_cluster_data(&self.client, cluster_name, &namespace).await?;
                Ok(TaskOutcome::Completed)
            }
        }
    }

    async fn require_cluster(
        &self,
        cluster_name: &str,
        namespace: &str,
    ) -> Result<crate::crd::PgCluster> {
        get_cluster(&self.client, cluster_name, namespace)
            .await?
            .ok_or_else(|| Error::NotFound(format!("cluster {}", cluster_name)))
    }

    /// Run a task if it still has work to do. Created tasks are fresh;
    /// Processed tasks are re-driven because an earlier run may have
    /// been interrupted mid-way, and every task action is idempotent.
    async fn run(&self, task: &PgTask) {
        let name = task.name_any();
        let namespace = task.namespace().unwrap_or_default();

        let state = task.status.as_ref().map(|s| s.state).unwrap_or_default();
        if !matches!(state, TaskState::Created | TaskState::Processed) {
            debug!(task = %name, namespace = %namespace, ?state, "skipping finished task");
            return;
        }

        match self.execute(task).await {
            Ok(TaskOutcome::Completed) => {
                let _ = set_task_status(&self.client, task, TaskState::Completed, "task completed")
                    .await;
            }
            Ok(TaskOutcome::InProgress) => {
                debug!(task = %name, namespace = %namespace, "task still in progress");
            }
            Err(e) => {
                error!(task = %name, namespace = %namespace, "task failed: {}", e);
                let _ = set_task_status(
                    &self.client,
                    task,
                    TaskState::Failed,
                    &format!("task failed: {}", e),
                )
                .await;
            }
        }
    }
}

#[async_trait]
impl EventHandler<PgTask> for TaskHandler {
    async fn on_add(&self, obj: &PgTask) {
        self.run(obj).await;
    }

    async fn on_update(&self, _old: &PgTask, new: &PgTask) {
        self.run(new).await;
    }

    async fn on_delete(&self, obj: &PgTask) {
        debug!(task = %obj.name_any(), "task removed");
    }
}
