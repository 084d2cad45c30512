//! Validation for PgCluster specs.
//!
//! Validation runs before any mutating call is issued; failures are
//! surfaced on the cluster status message and never retried until the
//! spec changes.

use crate::controller::error::{Error, Result};
use crate::crd::PgCluster;

/// Minimum cluster members (the primary itself)
pub const MIN_REPLICAS: i32 = 1;

/// Maximum cluster members (safety bound)
pub const MAX_REPLICAS: i32 = 16;

/// Validate a cluster spec.
pub fn validate_spec(cluster: &PgCluster) -> Result<()> {
    validate_replicas(cluster)?;
    validate_anti_affinity(cluster)?;
    validate_storage(cluster)?;
    validate_port(cluster)?;
    validate_tls(cluster)?;
    Ok(())
}

fn validate_replicas(cluster: &PgCluster) -> Result<()> {
    let replicas = cluster.spec.replicas;

    if replicas < MIN_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} is below minimum {}",
            replicas, MIN_REPLICAS
        )));
    }

    if replicas > MAX_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {} exceeds maximum {}",
            replicas, MAX_REPLICAS
        )));
    }

    Ok(())
}

fn validate_anti_affinity(cluster: &PgCluster) -> Result<()> {
    cluster
        .spec
        .anti_affinity
        .validate()
        .map_err(Error::ValidationError)
}

fn validate_storage(cluster: &PgCluster) -> Result<()> {
    validate_storage_size(&cluster.spec.primary_storage.size)?;
    for storage in [
        cluster.spec.replica_storage.as_ref(),
        cluster.spec.archive_storage.as_ref(),
        cluster.spec.backup_repo_storage.as_ref(),
    ]
    .into_iter()
    .flatten()
    {
        validate_storage_size(&storage.size)?;
    }
    for storage in cluster.spec.tablespace_mounts.values() {
        validate_storage_size(&storage.size)?;
    }
    Ok(())
}

fn validate_storage_size(size: &str) -> Result<()> {
    if !size.ends_with("Gi") && !size.ends_with("Mi") && !size.ends_with("Ti") {
        return Err(Error::ValidationError(format!(
            "storage size must end with Gi, Mi, or Ti: {}",
            size
        )));
    }

    let num_str = size.trim_end_matches(char::is_alphabetic);
    let _num: u64 = num_str
        .parse()
        .map_err(|_| Error::ValidationError(format!("invalid storage size number: {}", size)))?;

    Ok(())
}

fn validate_port(cluster: &PgCluster) -> Result<()> {
    let port = cluster.spec.port;
    if !(1..=65535).contains(&port) {
        return Err(Error::ValidationError(format!("invalid port: {}", port)));
    }
    Ok(())
}

fn validate_tls(cluster: &PgCluster) -> Result<()> {
    if cluster.spec.tls_only && !cluster.spec.tls.is_enabled() {
        return Err(Error::ValidationError(
            "tlsOnly requires both tls.caSecret and tls.tlsSecret".to_string(),
        ));
    }
    Ok(())
}
