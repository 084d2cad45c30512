use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PgCluster is the Schema for the pgclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgcluster.example.com",
    version = "v1",
    kind = "PgCluster",
    plural = "pgclusters",
    shortname = "pgc",
    namespaced,
    status = "PgClusterStatus",
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PgClusterSpec {
    /// Container image for PostgreSQL pods
    pub image: String,

    /// Image tag (encodes the PostgreSQL version)
    pub image_tag: String,

    /// PostgreSQL listen port
    #[serde(default = "default_port")]
    pub port: i32,

    /// Total cluster members: 1 = primary only, 2 = primary plus one
    /// replica, and so on
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Storage for the primary data volume
    pub primary_storage: StorageSpec,

    /// Storage for replica data volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_storage: Option<StorageSpec>,

    /// Storage for the WAL archive volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_storage: Option<StorageSpec>,

    /// Storage for the backup repository volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_repo_storage: Option<StorageSpec>,

    /// Backup repository path inside the repo volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_repo_path: Option<String>,

    /// Application database owner
    pub user: String,

    /// Application database name
    pub database: String,

    /// Secret holding the application user credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_secret_name: Option<String>,

    /// Secret holding the superuser credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_secret_name: Option<String>,

    /// Anti-affinity policy per deployment role
    #[serde(default)]
    pub anti_affinity: AntiAffinitySpec,

    /// TLS configuration
    #[serde(default)]
    pub tls: TlsSpec,

    /// Reject non-TLS connections. Only meaningful when TLS is enabled.
    #[serde(default)]
    pub tls_only: bool,

    /// Additional tablespace volumes, keyed by tablespace name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tablespace_mounts: BTreeMap<String, StorageSpec>,

    /// Run the cluster as a standby reading from the backup repository
    #[serde(default)]
    pub standby: bool,

    /// Scale the primary to zero while preserving definitions and volumes
    #[serde(default)]
    pub shutdown: bool,
}

fn default_replicas() -> i32 {
    1
}

fn default_port() -> i32 {
    5432
}

/// Storage configuration for one volume
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (cluster default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Volume size (e.g. "10Gi")
    pub size: String,
}

/// Deployment roles that carry their own anti-affinity policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AntiAffinityRole {
    Default,
    BackupRepo,
    Pooler,
}

/// Anti-affinity policy per deployment role
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AntiAffinitySpec {
    /// Policy for all PostgreSQL pods of the cluster
    #[serde(default)]
    pub default: AntiAffinityType,

    /// Policy for backup repository pods
    #[serde(default)]
    pub backup_repo: AntiAffinityType,

    /// Policy for connection pooler pods
    #[serde(default)]
    pub pooler: AntiAffinityType,
}

impl AntiAffinitySpec {
    pub fn for_role(&self, role: AntiAffinityRole) -> AntiAffinityType {
        match role {
            AntiAffinityRole::Default => self.default,
            AntiAffinityRole::BackupRepo => self.backup_repo,
            AntiAffinityRole::Pooler => self.pooler,
        }
    }

    /// Validate every per-role policy.
    pub fn validate(&self) -> Result<(), String> {
        self.default.validate()?;
        self.backup_repo.validate()?;
        self.pooler.validate()
    }
}

/// Scheduling constraint preventing two pods of the same role from
/// colocating. "required" maps to
/// requiredDuringSchedulingIgnoredDuringExecution, "preferred" to
/// preferredDuringSchedulingIgnoredDuringExecution, and "disabled" turns
/// the rule off. The empty value falls back to preferred.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AntiAffinityType {
    Required,
    Preferred,
    Disabled,
    #[default]
    #[serde(rename = "")]
    Unspecified,
}

impl AntiAffinityType {
    pub fn validate(&self) -> Result<(), String> {
        // All representable values are valid; the enum itself rejects
        // unknown strings at deserialization time. Kept as a method so
        // spec validation reads the same as the other checks.
        match self {
            AntiAffinityType::Required
            | AntiAffinityType::Preferred
            | AntiAffinityType::Disabled
            | AntiAffinityType::Unspecified => Ok(()),
        }
    }

    /// Effective policy once the empty value is defaulted.
    pub fn effective(&self) -> AntiAffinityType {
        match self {
            AntiAffinityType::Unspecified => AntiAffinityType::Preferred,
            other => *other,
        }
    }
}

impl fmt::Display for AntiAffinityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AntiAffinityType::Required => write!(f, "required"),
            AntiAffinityType::Preferred => write!(f, "preferred"),
            AntiAffinityType::Disabled => write!(f, "disabled"),
            AntiAffinityType::Unspecified => write!(f, ""),
        }
    }
}

/// TLS configuration for the cluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Secret with the trusted CA certificate ("ca.crt", optionally
    /// "ca.crl")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_secret: Option<String>,

    /// kubernetes.io/tls secret with the server keypair
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
}

impl TlsSpec {
    /// TLS is enabled only when both secret names are present.
    pub fn is_enabled(&self) -> bool {
        matches!(
            (&self.ca_secret, &self.tls_secret),
            (Some(ca), Some(tls)) if !ca.is_empty() && !tls.is_empty()
        )
    }
}

/// Lifecycle state of a PgCluster
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
pub enum ClusterState {
    /// Resource accepted, nothing provisioned yet
    #[default]
    Created,
    /// Provisioning task emitted and accepted
    Processed,
    /// Primary is ready; steady state
    Initialized,
    /// Primary is being recreated from the backup repository
    Restoring,
    /// Primary scaled to zero, definitions and volumes preserved
    Shutdown,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::Created => write!(f, "Created"),
            ClusterState::Processed => write!(f, "Processed"),
            ClusterState::Initialized => write!(f, "Initialized"),
            ClusterState::Restoring => write!(f, "Restoring"),
            ClusterState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Status of a PgCluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgClusterStatus {
    /// Current lifecycle state
    #[serde(default)]
    pub state: ClusterState,

    /// Last reconcile outcome, human readable
    #[serde(default)]
    pub message: String,

    /// When the state last changed, RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec_fields() {
        let spec: PgClusterSpec = serde_json::from_value(serde_json::json!({
            "image": "postgres",
            "imageTag": "16.3",
            "primaryStorage": {"size": "10Gi"},
            "user": "app",
            "database": "app",
        }))
        .unwrap();

        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.port, 5432);
        assert!(!spec.shutdown);
        assert!(!spec.standby);
        assert!(!spec.tls.is_enabled());
        assert_eq!(spec.anti_affinity.default, AntiAffinityType::Unspecified);
    }

    #[test]
    fn test_anti_affinity_round_trip() {
        let json = serde_json::json!({"default": "required", "backupRepo": "", "pooler": "disabled"});
        let spec: AntiAffinitySpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.default, AntiAffinityType::Required);
        assert_eq!(spec.backup_repo, AntiAffinityType::Unspecified);
        assert_eq!(spec.pooler, AntiAffinityType::Disabled);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_anti_affinity_rejects_unknown_value() {
        let json = serde_json::json!({"default": "sometimes"});
        assert!(serde_json::from_value::<AntiAffinitySpec>(json).is_err());
    }

    #[test]
    fn test_unspecified_defaults_to_preferred() {
        assert_eq!(
            AntiAffinityType::Unspecified.effective(),
            AntiAffinityType::Preferred
        );
        assert_eq!(
            AntiAffinityType::Required.effective(),
            AntiAffinityType::Required
        );
    }

    #[test]
    fn test_tls_enabled_requires_both_secrets() {
        let none = TlsSpec::default();
        assert!(!none.is_enabled());

        let partial = TlsSpec {
            ca_secret: Some("ca".into()),
            tls_secret: None,
        };
        assert!(!partial.is_enabled());

        let full = TlsSpec {
            ca_secret: Some("ca".into()),
            tls_secret: Some("server".into()),
        };
        assert!(full.is_enabled());
    }

    #[test]
    fn test_state_display_matches_serde() {
        for state in [
            ClusterState::Created,
            ClusterState::Processed,
            ClusterState::Initialized,
            ClusterState::Restoring,
            ClusterState::Shutdown,
        ] {
            let serialized = serde_json::to_value(state).unwrap();
            assert_eq!(serialized, serde_json::json!(state.to_string()));
        }
    }
}
