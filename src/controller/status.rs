//! Status updates for PgCluster resources.
//!
//! Status is patched through the status subresource with a merge patch
//! so concurrent spec edits are never clobbered. The cluster resource is
//! the sole durable record of observed state; repeated failures show up
//! as repeated message updates, not an error count.

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, warn};

use crate::config::FIELD_MANAGER;
use crate::controller::error::Result;
use crate::controller::state::{ClusterEvent, ClusterStateMachine, TransitionResult};
use crate::crd::{ClusterState, PgCluster, PgClusterStatus};

/// Writes PgCluster status for one cluster.
pub struct StatusManager<'a> {
    client: &'a Client,
    cluster: &'a PgCluster,
    namespace: &'a str,
}

impl<'a> StatusManager<'a> {
    pub fn new(client: &'a Client, cluster: &'a PgCluster, namespace: &'a str) -> Self {
        Self {
            client,
            cluster,
            namespace,
        }
    }

    fn current_state(&self) -> ClusterState {
        self.cluster
            .status
            .as_ref()
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Advance the lifecycle state if the transition table allows it.
    ///
    /// Invalid transitions (typically re-deliveries) are logged and
    /// dropped without touching the resource.
    pub async fn advance(&self, event: ClusterEvent, message: &str) -> Result<Option<ClusterState>> {
        let machine = ClusterStateMachine::new();
        let current = self.current_state();

        match machine.transition(current, event) {
            TransitionResult::Success {
                from,
                to,
                description,
            } => {
                debug!(
                    cluster = %self.cluster.name_any(),
                    namespace = %self.namespace,
                    %from,
                    %to,
                    "{}",
                    description
                );
                self.write(to, message).await?;
                Ok(Some(to))
            }
            TransitionResult::Invalid { current, event } => {
                warn!(
                    cluster = %self.cluster.name_any(),
                    namespace = %self.namespace,
                    state = %current,
                    %event,
                    "ignoring event with no valid transition"
                );
                Ok(None)
            }
        }
    }

    /// Record an initial state for a resource with no prior status.
    pub async fn set_initial(&self, message: &str) -> Result<()> {
        self.write(ClusterState::Created, message).await
    }

    /// Update only the status message, preserving the state.
    pub async fn set_message(&self, message: &str) -> Result<()> {
        self.write(self.current_state(), message).await
    }

    async fn write(&self, state: ClusterState, message: &str) -> Result<()> {
        let api: Api<PgCluster> = Api::namespaced(self.client.clone(), self.namespace);
        let name = self.cluster.name_any();

        let status = PgClusterStatus {
            state,
            message: message.to_string(),
            last_transition_time: Some(Utc::now().to_rfc3339()),
        };

        let patch = serde_json::json!({ "status": status });

        api.patch_status(
            &name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        Ok(())
    }
}
