//! Replica member reconciliation.
//!
//! Each PgReplica materializes one deployment carrying the replica role
//! labels. The cluster reconciler owns how many PgReplica resources
//! exist; this handler owns turning each one into a deployment and
//! tearing the deployment down when the resource goes away.

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info};

use crate::config::FIELD_MANAGER;
use crate::controller::cluster::get_cluster;
use crate::controller::error::Result;
use crate::crd::PgReplica;
use crate::resources::cluster::generate_replica_deployment;
use crate::resources::deployment::{create_deployment, delete_deployment, get_deployment};
use crate::watch::EventHandler;

/// Handles PgReplica add/update/delete events.
pub struct ReplicaHandler {
    client: Client,
}

impl ReplicaHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Ensure the member deployment exists. Safe to repeat.
    async fn ensure_deployment(&self, replica: &PgReplica) -> Result<()> {
        let name = replica.name_any();
        let namespace = replica.namespace().unwrap_or_default();

        let Some(cluster) =
            get_cluster(&self.client, &replica.spec.cluster_name, &namespace).await?
        else {
            debug!(
                replica = %name,
                cluster = %replica.spec.cluster_name,
                "replica references a missing cluster"
            );
            return Ok(());
        };

        if get_deployment(&self.client, &name, &namespace).await?.is_none() {
            let deployment = generate_replica_deployment(&cluster, &name);
            create_deployment(&self.client, &deployment, &namespace).await?;
            info!(replica = %name, namespace = %namespace, "created replica deployment");
        }

        self.set_status(replica, "processed", "replica deployment present")
            .await
    }

    async fn set_status(&self, replica: &PgReplica, state: &str, message: &str) -> Result<()> {
        let namespace = replica.namespace().unwrap_or_default();
        let api: Api<PgReplica> = Api::namespaced(self.client.clone(), &namespace);

        let patch = serde_json::json!({
            "status": {
                "state": state,
                "message": message,
            }
        });

        api.patch_status(
            &replica.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler<PgReplica> for ReplicaHandler {
    async fn on_add(&self, obj: &PgReplica) {
        if let Err(e) = self.ensure_deployment(obj).await {
            error!(replica = %obj.name_any(), "error reconciling replica: {}", e);
            let _ = self
                .set_status(obj, "failed", &format!("reconcile failed: {}", e))
                .await;
        }
    }

    async fn on_update(&self, _old: &PgReplica, new: &PgReplica) {
        // Resync self-heals a missing deployment.
        if let Err(e) = self.ensure_deployment(new).await {
            error!(replica = %new.name_any(), "error reconciling replica: {}", e);
        }
    }

    async fn on_delete(&self, obj: &PgReplica) {
        let name = obj.name_any();
        let namespace = obj.namespace().unwrap_or_default();

        match delete_deployment(&self.client, &name, &namespace).await {
            Ok(()) => info!(replica = %name, namespace = %namespace, "removed replica deployment"),
            Err(e) if e.is_not_found() => {
                debug!(replica = %name, namespace = %namespace, "replica deployment already gone");
            }
            Err(e) => {
                error!(replica = %name, namespace = %namespace, "error removing replica deployment: {}", e);
            }
        }
    }
}
