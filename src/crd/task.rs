use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameter keys shared between task producers and the task controller.
pub const TASK_PARAM_CLUSTER: &str = "cluster";
pub const TASK_PARAM_TARGET: &str = "target";
pub const TASK_PARAM_PITR_TARGET: &str = "pitr-target";

/// PgTask is a work item consumed by the task controller. Provisioning,
/// failover, restore, and deletion cleanup are all driven through tasks
/// so they survive controller restarts and re-delivery.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgcluster.example.com",
    version = "v1",
    kind = "PgTask",
    plural = "pgtasks",
    namespaced,
    status = "PgTaskStatus",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.taskType"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgTaskSpec {
    /// What this task does
    pub task_type: TaskType,

    /// String parameters, keyed by the TASK_PARAM_* constants
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl PgTaskSpec {
    /// Cluster this task operates on.
    pub fn cluster(&self) -> Option<&str> {
        self.parameters.get(TASK_PARAM_CLUSTER).map(String::as_str)
    }
}

/// Task kinds understood by the task controller
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum TaskType {
    /// Create the cluster's secret, deployments, and services
    Provision,
    /// Promote a replica deployment to primary
    Failover,
    /// Recreate the primary from the backup repository
    Restore,
    /// Remove the data of a deleted cluster
    RemoveData,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Provision => write!(f, "Provision"),
            TaskType::Failover => write!(f, "Failover"),
            TaskType::Restore => write!(f, "Restore"),
            TaskType::RemoveData => write!(f, "RemoveData"),
        }
    }
}

/// Progress of a PgTask
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum TaskState {
    #[default]
    Created,
    Processed,
    Completed,
    Failed,
}

/// Status of a PgTask
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgTaskStatus {
    #[serde(default)]
    pub state: TaskState,

    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_cluster_parameter() {
        let mut parameters = BTreeMap::new();
        parameters.insert(TASK_PARAM_CLUSTER.to_string(), "mycluster".to_string());
        let spec = PgTaskSpec {
            task_type: TaskType::Provision,
            parameters,
        };
        assert_eq!(spec.cluster(), Some("mycluster"));

        let empty = PgTaskSpec {
            task_type: TaskType::Provision,
            parameters: BTreeMap::new(),
        };
        assert_eq!(empty.cluster(), None);
    }
}
