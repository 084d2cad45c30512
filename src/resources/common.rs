//! Shared helpers for generated cluster resources.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::config::{
    LABEL_NAME, LABEL_PG_CLUSTER, LABEL_PRIMARY, LABEL_REPLICA, LABEL_VENDOR, LABEL_VENDOR_VALUE,
};
use crate::crd::PgCluster;

/// API version of the PgCluster CRD
pub const API_VERSION: &str = "pgcluster.example.com/v1";

/// Kind of the PgCluster CRD
pub const KIND: &str = "PgCluster";

/// Owner reference pointing derived objects at their cluster so the
/// platform garbage collects them on cluster deletion.
pub fn owner_reference(cluster: &PgCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Role labels for one deployment of a cluster. The triple on `name`,
/// `primary`, and `replica` is the durable record of replication role.
pub fn role_labels(
    cluster_name: &str,
    deployment_name: &str,
    primary: bool,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_VENDOR.to_string(), LABEL_VENDOR_VALUE.to_string()),
        (LABEL_PG_CLUSTER.to_string(), cluster_name.to_string()),
        (LABEL_NAME.to_string(), deployment_name.to_string()),
        (LABEL_PRIMARY.to_string(), primary.to_string()),
        (LABEL_REPLICA.to_string(), (!primary).to_string()),
    ])
}

/// Selector matching every deployment of a cluster.
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{}={}", LABEL_PG_CLUSTER, cluster_name)
}

/// Selector matching the current primary deployment of a cluster.
pub fn primary_selector(cluster_name: &str) -> String {
    format!(
        "{}={},{}=true",
        LABEL_PG_CLUSTER, cluster_name, LABEL_PRIMARY
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_labels_for_primary() {
        let labels = role_labels("mycluster", "mycluster", true);
        assert_eq!(labels.get(LABEL_VENDOR), Some(&LABEL_VENDOR_VALUE.to_string()));
        assert_eq!(labels.get(LABEL_PG_CLUSTER), Some(&"mycluster".to_string()));
        assert_eq!(labels.get(LABEL_PRIMARY), Some(&"true".to_string()));
        assert_eq!(labels.get(LABEL_REPLICA), Some(&"false".to_string()));
    }

    #[test]
    fn test_role_labels_for_replica() {
        let labels = role_labels("mycluster", "mycluster-repl-1", false);
        assert_eq!(labels.get(LABEL_NAME), Some(&"mycluster-repl-1".to_string()));
        assert_eq!(labels.get(LABEL_PRIMARY), Some(&"false".to_string()));
        assert_eq!(labels.get(LABEL_REPLICA), Some(&"true".to_string()));
    }

    #[test]
    fn test_selectors() {
        assert_eq!(cluster_selector("c1"), "pg-cluster=c1");
        assert_eq!(primary_selector("c1"), "pg-cluster=c1,primary=true");
    }
}
