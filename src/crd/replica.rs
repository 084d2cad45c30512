use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::StorageSpec;

/// PgReplica declares one replica member of a PgCluster. The replica
/// controller materializes exactly one deployment per PgReplica; cluster
/// scale up/down is reconciled by creating and deleting these resources.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgcluster.example.com",
    version = "v1",
    kind = "PgReplica",
    plural = "pgreplicas",
    namespaced,
    status = "PgReplicaStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgReplicaSpec {
    /// Name of the PgCluster this replica belongs to
    pub cluster_name: String,

    /// Storage for this replica's data volume; falls back to the
    /// cluster's replica storage when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Pin the replica to a node (best effort)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

/// Status of a PgReplica
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgReplicaStatus {
    /// Deployment state for this member
    #[serde(default)]
    pub state: String,

    /// Last reconcile outcome, human readable
    #[serde(default)]
    pub message: String,
}
