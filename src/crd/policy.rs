use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PgPolicy holds a named SQL policy that can be applied to clusters.
/// The policy controller validates the definition; applying the SQL
/// inside database pods is a collaborator concern.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "pgcluster.example.com",
    version = "v1",
    kind = "PgPolicy",
    plural = "pgpolicies",
    namespaced,
    status = "PgPolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PgPolicySpec {
    /// Inline SQL for the policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,

    /// URL to fetch the policy SQL from, mutually exclusive with `sql`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl PgPolicySpec {
    /// A policy must carry exactly one source.
    pub fn validate(&self) -> Result<(), String> {
        match (&self.sql, &self.url) {
            (Some(_), Some(_)) => Err("policy declares both sql and url".to_string()),
            (None, None) => Err("policy declares neither sql nor url".to_string()),
            _ => Ok(()),
        }
    }
}

/// Status of a PgPolicy
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgPolicyStatus {
    #[serde(default)]
    pub state: String,

    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_requires_exactly_one_source() {
        let both = PgPolicySpec {
            sql: Some("grant all".into()),
            url: Some("https://example.com/p.sql".into()),
        };
        assert!(both.validate().is_err());

        let neither = PgPolicySpec {
            sql: None,
            url: None,
        };
        assert!(neither.validate().is_err());

        let sql_only = PgPolicySpec {
            sql: Some("grant all".into()),
            url: None,
        };
        assert!(sql_only.validate().is_ok());
    }
}
