//! Pod readiness observation.
//!
//! The primary pod becoming ready is what advances a cluster out of
//! Processed (initial provisioning) or Restoring (primary recreation).
//! Everything else about pods is the platform's business.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Client, ResourceExt};
use tracing::{debug, error};

use crate::config::{LABEL_PG_CLUSTER, LABEL_PRIMARY};
use crate::controller::cluster::get_cluster;
use crate::controller::state::ClusterEvent;
use crate::controller::status::StatusManager;
use crate::crd::ClusterState;
use crate::watch::EventHandler;

/// Handles pod events for cluster member pods.
pub struct PodHandler {
    client: Client,
}

impl PodHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn observe(&self, pod: &Pod) {
        let labels = pod.labels();
        if labels.get(LABEL_PRIMARY).map(String::as_str) != Some("true") {
            return;
        }
        let Some(cluster_name) = labels.get(LABEL_PG_CLUSTER) else {
            return;
        };
        if !pod_ready(pod) {
            return;
        }

        let namespace = pod.namespace().unwrap_or_default();
        let cluster = match get_cluster(&self.client, cluster_name, &namespace).await {
            Ok(Some(cluster)) => cluster,
            Ok(None) => {
                debug!(
                    pod = %pod.name_any(),
                    cluster = %cluster_name,
                    "primary pod without a cluster resource"
                );
                return;
            }
            Err(e) => {
                error!(cluster = %cluster_name, namespace = %namespace, "error fetching cluster: {}", e);
                return;
            }
        };

        let state = cluster
            .status
            .as_ref()
            .map(|s| s.state)
            .unwrap_or_default();
        let message = match state {
            ClusterState::Processed => "cluster initialized",
            ClusterState::Restoring => "restore complete, primary ready",
            // Steady state; a ready primary is not news.
            _ => return,
        };

        let status = StatusManager::new(&self.client, &cluster, &namespace);
        if let Err(e) = status.advance(ClusterEvent::PrimaryReady, message).await {
            error!(cluster = %cluster_name, namespace = %namespace, "error updating status: {}", e);
        }
    }
}

/// A pod is ready when its Ready condition is True.
fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

#[async_trait]
impl EventHandler<Pod> for PodHandler {
    async fn on_add(&self, obj: &Pod) {
        self.observe(obj).await;
    }

    async fn on_update(&self, _old: &Pod, new: &Pod) {
        self.observe(new).await;
    }

    async fn on_delete(&self, obj: &Pod) {
        debug!(pod = %obj.name_any(), "pod removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kube::core::ObjectMeta;

    fn pod_with_condition(type_: &str, status: &str) -> Pod {
        Pod {
            metadata: ObjectMeta::default(),
            spec: None,
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_pod_ready_condition() {
        assert!(pod_ready(&pod_with_condition("Ready", "True")));
        assert!(!pod_ready(&pod_with_condition("Ready", "False")));
        assert!(!pod_ready(&pod_with_condition("PodScheduled", "True")));
        assert!(!pod_ready(&Pod::default()));
    }
}
