use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use rand::Rng;

use crate::crd::PgCluster;
use crate::resources::common::{owner_reference, role_labels};

/// Generate a secure random password
fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Name of the generated user credentials secret, used when the spec
/// does not reference an existing one.
pub fn user_secret_name(cluster: &PgCluster) -> String {
    cluster
        .spec
        .user_secret_name
        .clone()
        .unwrap_or_else(|| format!("{}-user-secret", cluster.name_any()))
}

/// Generate the application user credentials secret.
pub fn generate_user_secret(cluster: &PgCluster) -> Secret {
    let cluster_name = cluster.name_any();

    let string_data = BTreeMap::from([
        ("username".to_string(), cluster.spec.user.clone()),
        ("password".to_string(), generate_password(24)),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(user_secret_name(cluster)),
            namespace: cluster.namespace(),
            labels: Some(role_labels(&cluster_name, &cluster_name, true)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_length_and_charset() {
        let password = generate_password(24);
        assert_eq!(password.len(), 24);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
