//! Deployment definitions for cluster members.
//!
//! One deployment per member: the primary carries
//! `primary=true, replica=false`, replicas the inverse. The label triple
//! on selector and template is what the failover patch flips, so the
//! generators here and the promotion primitive must agree on it.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaimVolumeSource,
    PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec, SecretKeySelector, SecretVolumeSource,
    Volume, VolumeMount, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::config::LABEL_PG_CLUSTER;
use crate::crd::{AntiAffinityRole, AntiAffinityType, PgCluster};
use crate::resources::common::{owner_reference, role_labels};

/// Environment variable carrying the point-in-time recovery target into
/// a restored primary.
pub const ENV_PITR_TARGET: &str = "PITR_TARGET";

/// Name of a replica member's deployment.
pub fn replica_deployment_name(cluster_name: &str, index: i32) -> String {
    format!("{}-repl-{}", cluster_name, index)
}

/// Name of a member's data volume claim.
pub fn data_volume_claim_name(deployment_name: &str) -> String {
    format!("{}-data", deployment_name)
}

/// Generate the primary deployment. A restore sets `recovery_target` so
/// the recreated primary rolls forward to that point in time.
pub fn generate_primary_deployment(
    cluster: &PgCluster,
    recovery_target: Option<&str>,
) -> Deployment {
    let name = cluster.name_any();
    generate_member_deployment(cluster, &name, true, recovery_target)
}

/// Generate one replica member deployment. Volume claims are referenced
/// by derived name; provisioning them is a storage-driver concern.
pub fn generate_replica_deployment(cluster: &PgCluster, replica_name: &str) -> Deployment {
    generate_member_deployment(cluster, replica_name, false, None)
}

fn generate_member_deployment(
    cluster: &PgCluster,
    deployment_name: &str,
    primary: bool,
    recovery_target: Option<&str>,
) -> Deployment {
    let cluster_name = cluster.name_any();
    let labels = role_labels(&cluster_name, deployment_name, primary);

    let mut env = vec![
        EnvVar {
            name: "PG_DATABASE".to_string(),
            value: Some(cluster.spec.database.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "PG_USER".to_string(),
            value: Some(cluster.spec.user.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "PG_PORT".to_string(),
            value: Some(cluster.spec.port.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "PG_MODE".to_string(),
            value: Some(if primary { "primary" } else { "replica" }.to_string()),
            ..Default::default()
        },
    ];

    if let Some(secret) = &cluster.spec.user_secret_name {
        env.push(EnvVar {
            name: "PG_PASSWORD".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.clone(),
                    key: "password".to_string(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    if cluster.spec.standby {
        env.push(EnvVar {
            name: "PG_STANDBY".to_string(),
            value: Some("true".to_string()),
            ..Default::default()
        });
    }

    if let Some(target) = recovery_target {
        env.push(EnvVar {
            name: ENV_PITR_TARGET.to_string(),
            value: Some(target.to_string()),
            ..Default::default()
        });
    }

    if cluster.spec.tls.is_enabled() {
        env.push(EnvVar {
            name: "PG_TLS_ONLY".to_string(),
            value: Some(cluster.spec.tls_only.to_string()),
            ..Default::default()
        });
    }

    let mut volumes = vec![Volume {
        name: "pgdata".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: data_volume_claim_name(deployment_name),
            ..Default::default()
        }),
        ..Default::default()
    }];
    let mut mounts = vec![VolumeMount {
        name: "pgdata".to_string(),
        mount_path: "/pgdata".to_string(),
        ..Default::default()
    }];

    for tablespace in cluster.spec.tablespace_mounts.keys() {
        let volume_name = format!("tablespace-{}", tablespace);
        volumes.push(Volume {
            name: volume_name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: format!("{}-tablespace-{}", deployment_name, tablespace),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: volume_name,
            mount_path: format!("/tablespaces/{}", tablespace),
            ..Default::default()
        });
    }

    if cluster.spec.tls.is_enabled() {
        if let Some(tls_secret) = &cluster.spec.tls.tls_secret {
            volumes.push(Volume {
                name: "tls-keypair".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(tls_secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: "tls-keypair".to_string(),
                mount_path: "/pgconf/tls".to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }
        if let Some(ca_secret) = &cluster.spec.tls.ca_secret {
            volumes.push(Volume {
                name: "tls-ca".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(ca_secret.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: "tls-ca".to_string(),
                mount_path: "/pgconf/tls-ca".to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }
    }

    let container = Container {
        name: "database".to_string(),
        image: Some(format!("{}:{}", cluster.spec.image, cluster.spec.image_tag)),
        ports: Some(vec![ContainerPort {
            container_port: cluster.spec.port,
            name: Some("postgres".to_string()),
            ..Default::default()
        }]),
        env: Some(env),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let affinity = build_affinity(
        &cluster_name,
        cluster.spec.anti_affinity.for_role(AntiAffinityRole::Default),
    );

    Deployment {
        metadata: ObjectMeta {
            name: Some(deployment_name.to_string()),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    affinity,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Build the anti-affinity stanza for one deployment role.
pub fn build_affinity(cluster_name: &str, policy: AntiAffinityType) -> Option<Affinity> {
    let term = PodAffinityTerm {
        label_selector: Some(LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: LABEL_PG_CLUSTER.to_string(),
                operator: "In".to_string(),
                values: Some(vec![cluster_name.to_string()]),
            }]),
            ..Default::default()
        }),
        topology_key: "kubernetes.io/hostname".to_string(),
        ..Default::default()
    };

    let anti_affinity = match policy.effective() {
        AntiAffinityType::Required => PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![term]),
            ..Default::default()
        },
        AntiAffinityType::Preferred => PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: term,
                },
            ]),
            ..Default::default()
        },
        AntiAffinityType::Disabled => return None,
        AntiAffinityType::Unspecified => unreachable!("effective() never returns Unspecified"),
    };

    Some(Affinity {
        pod_anti_affinity: Some(anti_affinity),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LABEL_NAME, LABEL_PRIMARY, LABEL_REPLICA};
    use crate::crd::{AntiAffinitySpec, PgClusterSpec, StorageSpec, TlsSpec};
    use std::collections::BTreeMap;

    fn cluster(anti_affinity: AntiAffinityType) -> PgCluster {
        PgCluster {
            metadata: ObjectMeta {
                name: Some("mycluster".to_string()),
                namespace: Some("pgdata".to_string()),
                uid: Some("abc-123".to_string()),
                ..Default::default()
            },
            spec: PgClusterSpec {
                image: "postgres".to_string(),
                image_tag: "16.3".to_string(),
                port: 5432,
                replicas: 2,
                primary_storage: StorageSpec {
                    storage_class: None,
                    size: "10Gi".to_string(),
                },
                replica_storage: None,
                archive_storage: None,
                backup_repo_storage: None,
                backup_repo_path: None,
                user: "app".to_string(),
                database: "app".to_string(),
                user_secret_name: Some("mycluster-user".to_string()),
                root_secret_name: None,
                anti_affinity: AntiAffinitySpec {
                    default: anti_affinity,
                    ..Default::default()
                },
                tls: TlsSpec::default(),
                tls_only: false,
                tablespace_mounts: BTreeMap::new(),
                standby: false,
                shutdown: false,
            },
            status: None,
        }
    }

    fn template_labels(deployment: &Deployment) -> BTreeMap<String, String> {
        deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .clone()
            .unwrap()
    }

    #[test]
    fn test_primary_carries_primary_role_labels() {
        let deployment = generate_primary_deployment(&cluster(AntiAffinityType::Unspecified), None);
        let labels = template_labels(&deployment);

        assert_eq!(labels.get(LABEL_NAME), Some(&"mycluster".to_string()));
        assert_eq!(labels.get(LABEL_PRIMARY), Some(&"true".to_string()));
        assert_eq!(labels.get(LABEL_REPLICA), Some(&"false".to_string()));

        // Selector and template must agree for the failover patch
        let selector = deployment
            .spec
            .as_ref()
            .unwrap()
            .selector
            .match_labels
            .clone()
            .unwrap();
        assert_eq!(selector, labels);
    }

    #[test]
    fn test_replica_carries_replica_role_labels() {
        let c = cluster(AntiAffinityType::Unspecified);
        let name = replica_deployment_name("mycluster", 1);
        let deployment = generate_replica_deployment(&c, &name);
        let labels = template_labels(&deployment);

        assert_eq!(labels.get(LABEL_NAME), Some(&"mycluster-repl-1".to_string()));
        assert_eq!(labels.get(LABEL_PRIMARY), Some(&"false".to_string()));
        assert_eq!(labels.get(LABEL_REPLICA), Some(&"true".to_string()));
    }

    #[test]
    fn test_recovery_target_is_injected() {
        let deployment =
            generate_primary_deployment(&cluster(AntiAffinityType::Unspecified), Some("2026-01-02 03:04:05"));

        let env = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        let target = env.iter().find(|e| e.name == ENV_PITR_TARGET).unwrap();
        assert_eq!(target.value.as_deref(), Some("2026-01-02 03:04:05"));
    }

    #[test]
    fn test_no_recovery_target_by_default() {
        let deployment = generate_primary_deployment(&cluster(AntiAffinityType::Unspecified), None);
        let env = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        assert!(env.iter().all(|e| e.name != ENV_PITR_TARGET));
    }

    #[test]
    fn test_anti_affinity_required() {
        let affinity = build_affinity("mycluster", AntiAffinityType::Required).unwrap();
        let anti = affinity.pod_anti_affinity.unwrap();
        assert!(anti.required_during_scheduling_ignored_during_execution.is_some());
        assert!(anti.preferred_during_scheduling_ignored_during_execution.is_none());
    }

    #[test]
    fn test_anti_affinity_defaults_to_preferred() {
        let affinity = build_affinity("mycluster", AntiAffinityType::Unspecified).unwrap();
        let anti = affinity.pod_anti_affinity.unwrap();
        assert!(anti.preferred_during_scheduling_ignored_during_execution.is_some());
    }

    #[test]
    fn test_anti_affinity_disabled() {
        assert!(build_affinity("mycluster", AntiAffinityType::Disabled).is_none());
    }

    #[test]
    fn test_tls_volumes_mounted_when_enabled() {
        let mut c = cluster(AntiAffinityType::Unspecified);
        c.spec.tls = TlsSpec {
            ca_secret: Some("mycluster-ca".to_string()),
            tls_secret: Some("mycluster-tls".to_string()),
        };

        let deployment = generate_primary_deployment(&c, None);
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        assert!(volumes.iter().any(|v| v.name == "tls-keypair"));
        assert!(volumes.iter().any(|v| v.name == "tls-ca"));
    }

    #[test]
    fn test_tablespace_volumes() {
        let mut c = cluster(AntiAffinityType::Unspecified);
        c.spec.tablespace_mounts.insert(
            "fastspace".to_string(),
            StorageSpec {
                storage_class: None,
                size: "5Gi".to_string(),
            },
        );

        let deployment = generate_primary_deployment(&c, None);
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let mounts = pod.containers[0].volume_mounts.clone().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == "/tablespaces/fastspace"));
    }
}
