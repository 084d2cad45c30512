//! Operator configuration and the label protocol shared with managed objects.

use std::time::Duration;

use tracing::warn;

/// Ownership label key carried by every object this operator manages.
pub const LABEL_VENDOR: &str = "vendor";

/// Ownership label value identifying this operator's objects.
pub const LABEL_VENDOR_VALUE: &str = "pgcluster-operator";

/// Label naming the operator installation that owns a namespace.
pub const LABEL_INSTALLATION: &str = "pgcluster-installation";

/// Deployment role labels. These encode replication topology on both the
/// selector and the pod template and must match bit-for-bit across the
/// reconciler, the promotion patch, and the services that route on them.
pub const LABEL_NAME: &str = "name";
pub const LABEL_PRIMARY: &str = "primary";
pub const LABEL_REPLICA: &str = "replica";

/// Cluster membership label applied to every deployment of a cluster.
pub const LABEL_PG_CLUSTER: &str = "pg-cluster";

/// Label tying a job to the task that spawned it.
pub const LABEL_TASK: &str = "task-name";

/// Field manager name used for all patch operations.
pub const FIELD_MANAGER: &str = "pgcluster-operator";

/// Runtime configuration for one operator instance.
///
/// The installation name is explicit constructor state rather than a
/// process-wide global so multiple instances can coexist in tests.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Installation identity compared against namespace labels.
    pub installation_name: String,
    /// Resync period for per-namespace resource watches. Zero disables
    /// synthetic re-delivery.
    pub resync_period: Duration,
}

impl OperatorConfig {
    pub fn new(installation_name: impl Into<String>, resync_period: Duration) -> Self {
        Self {
            installation_name: installation_name.into(),
            resync_period,
        }
    }

    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        let installation_name = std::env::var("INSTALLATION_NAME").unwrap_or_else(|_| {
            warn!("INSTALLATION_NAME not set, using 'default'");
            "default".to_string()
        });

        let resync_period = std::env::var("RESYNC_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RESYNC);

        Self {
            installation_name,
            resync_period,
        }
    }
}

/// Default watch resync period.
const DEFAULT_RESYNC: Duration = Duration::from_secs(300);

impl Default for OperatorConfig {
    fn default() -> Self {
        Self::new("default", DEFAULT_RESYNC)
    }
}
