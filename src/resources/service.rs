use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::config::{LABEL_PG_CLUSTER, LABEL_PRIMARY, LABEL_REPLICA};
use crate::crd::PgCluster;
use crate::resources::common::{owner_reference, role_labels};

/// Service routing to the current primary. The selector matches on the
/// role labels the failover patch flips, so promotion retargets traffic
/// without touching the service.
pub fn generate_primary_service(cluster: &PgCluster) -> Service {
    generate_service(cluster, &cluster.name_any(), LABEL_PRIMARY)
}

/// Service routing to replica members for read traffic.
pub fn generate_replica_service(cluster: &PgCluster) -> Service {
    generate_service(cluster, &format!("{}-replica", cluster.name_any()), LABEL_REPLICA)
}

fn generate_service(cluster: &PgCluster, name: &str, role_label: &str) -> Service {
    let cluster_name = cluster.name_any();

    let selector = BTreeMap::from([
        (LABEL_PG_CLUSTER.to_string(), cluster_name.clone()),
        (role_label.to_string(), "true".to_string()),
    ]);

    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: cluster.namespace(),
            labels: Some(role_labels(&cluster_name, name, role_label == LABEL_PRIMARY)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("postgres".to_string()),
                port: cluster.spec.port,
                target_port: Some(IntOrString::Int(cluster.spec.port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}
