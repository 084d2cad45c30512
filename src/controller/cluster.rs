//! Cluster lifecycle reconciliation.
//!
//! The handler consumes PgCluster events and drives the lifecycle state
//! machine. Every action is idempotent: there is no internal retry, the
//! next resync or spec-change event converges an interrupted or failed
//! step, and not-found collaborator responses mean "already converged".

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::config::{
    FIELD_MANAGER, LABEL_PG_CLUSTER, LABEL_VENDOR, LABEL_VENDOR_VALUE,
};
use crate::controller::error::{Error, Result};
use crate::controller::state::ClusterEvent;
use crate::controller::status::StatusManager;
use crate::controller::validation::validate_spec;
use crate::crd::{
    ClusterState, PgCluster, PgReplica, PgReplicaSpec, PgTask, PgTaskSpec, TaskType,
    TASK_PARAM_CLUSTER, TASK_PARAM_PITR_TARGET, TASK_PARAM_TARGET,
};
use crate::resources::cluster::{generate_primary_deployment, replica_deployment_name};
use crate::resources::common::{cluster_selector, primary_selector};
use crate::resources::deployment::{
    create_deployment, delete_deployment, demote_deployment, get_deployment, list_deployments,
    patch_replicas, promote_deployment,
};
use crate::resources::secret::{generate_user_secret, user_secret_name};
use crate::resources::service::{generate_primary_service, generate_replica_service};
use crate::watch::EventHandler;

/// JSON pointer to a deployment's replica count, the only field the
/// shutdown and resume patches touch.
const REPLICAS_POINTER: &str = "/spec/replicas";

/// Handles PgCluster add/update/delete events.
pub struct ClusterHandler {
    client: Client,
}

impl ClusterHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventHandler<PgCluster> for ClusterHandler {
    async fn on_add(&self, obj: &PgCluster) {
        let name = obj.name_any();
        let namespace = obj.namespace().unwrap_or_default();
        debug!(cluster = %name, namespace = %namespace, "cluster added");

        if obj.status.is_none() {
            if let Err(e) = accept_cluster(&self.client, obj).await {
                error!(cluster = %name, namespace = %namespace, "error accepting cluster: {}", e);
            }
            return;
        }

        // Re-delivery after a watch restart; converge from current state.
        if let Err(e) = reconcile(&self.client, obj).await {
            error!(cluster = %name, namespace = %namespace, "error reconciling cluster: {}", e);
        }
    }

    async fn on_update(&self, _old: &PgCluster, new: &PgCluster) {
        let name = new.name_any();
        let namespace = new.namespace().unwrap_or_default();

        if let Err(e) = reconcile(&self.client, new).await {
            error!(cluster = %name, namespace = %namespace, "error reconciling cluster: {}", e);
            let status = StatusManager::new(&self.client, new, &namespace);
            let _ = status.set_message(&format!("reconcile failed: {}", e)).await;
        }
    }

    async fn on_delete(&self, obj: &PgCluster) {
        let name = obj.name_any();
        let namespace = obj.namespace().unwrap_or_default();
        info!(cluster = %name, namespace = %namespace, "cluster deleted, cleaning up");

        if let Err(e) = cleanup_cluster(&self.client, &name, &namespace).await {
            error!(cluster = %name, namespace = %namespace, "error cleaning up cluster: {}", e);
        }
    }
}

/// First contact with a new resource: validate, record Created, emit the
/// provisioning task, and advance to Processed once it is accepted.
async fn accept_cluster(client: &Client, cluster: &PgCluster) -> Result<()> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let status = StatusManager::new(client, cluster, &namespace);

    if let Err(e) = validate_spec(cluster) {
        warn!(cluster = %name, namespace = %namespace, "spec rejected: {}", e);
        status.set_initial(&format!("spec rejected: {}", e)).await?;
        return Ok(());
    }

    status.set_initial("cluster accepted").await?;
    queue_provisioning(client, cluster).await
}

/// Converge a cluster from its current state. Safe to repeat against an
/// already-converged cluster.
async fn reconcile(client: &Client, cluster: &PgCluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let state = cluster
        .status
        .as_ref()
        .map(|s| s.state)
        .unwrap_or_default();
    let status = StatusManager::new(client, cluster, &namespace);

    match state {
        ClusterState::Created => {
            // Spec may have been fixed since a validation rejection.
            if validate_spec(cluster).is_ok() {
                queue_provisioning(client, cluster).await?;
            }
            Ok(())
        }
        ClusterState::Processed => check_primary_ready(client, cluster, "cluster initialized").await,
        ClusterState::Restoring => {
            check_primary_ready(client, cluster, "restore complete, primary ready").await
        }
        ClusterState::Initialized => {
            if cluster.spec.shutdown {
                shutdown_cluster(client, cluster, &status).await
            } else {
                reconcile_replica_set(client, cluster).await
            }
        }
        ClusterState::Shutdown => {
            if !cluster.spec.shutdown {
                resume_cluster(client, cluster, &status).await
            } else {
                Ok(())
            }
        }
    }
}

/// Emit the provisioning task and move to Processed. A task that already
/// exists counts as accepted.
async fn queue_provisioning(client: &Client, cluster: &PgCluster) -> Result<()> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    let mut parameters = BTreeMap::new();
    parameters.insert(TASK_PARAM_CLUSTER.to_string(), name.clone());
    create_task(
        client,
        &namespace,
        &format!("{}-provision", name),
        &name,
        TaskType::Provision,
        parameters,
    )
    .await?;

    StatusManager::new(client, cluster, &namespace)
        .advance(ClusterEvent::ProvisioningQueued, "provisioning task queued")
        .await?;
    Ok(())
}

/// Advance to Initialized once the primary deployment reports a ready
/// replica. Called from Processed and Restoring alike; the transition
/// table drops anything else.
async fn check_primary_ready(client: &Client, cluster: &PgCluster, message: &str) -> Result<()> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    let Some(primary) = get_deployment(client, &name, &namespace).await? else {
        debug!(cluster = %name, namespace = %namespace, "primary deployment not created yet");
        return Ok(());
    };

    let ready = primary
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);

    if ready >= 1 {
        StatusManager::new(client, cluster, &namespace)
            .advance(ClusterEvent::PrimaryReady, message)
            .await?;
    }
    Ok(())
}

/// Scale the primary to zero, preserving the deployment definition and
/// its volumes.
async fn shutdown_cluster(
    client: &Client,
    cluster: &PgCluster,
    status: &StatusManager<'_>,
) -> Result<()> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    // Fresh read immediately before the mutation.
    let Some(primary) = get_deployment(client, &name, &namespace).await? else {
        return Err(Error::NotFound(format!("primary deployment {}", name)));
    };

    let current = primary.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    if current != 0 {
        patch_replicas(client, &name, &namespace, REPLICAS_POINTER, 0).await?;
    }

    status
        .advance(ClusterEvent::ShutdownRequested, "primary scaled to zero")
        .await?;
    Ok(())
}

/// Scale the primary back to one replica after spec.shutdown reverts.
async fn resume_cluster(
    client: &Client,
    cluster: &PgCluster,
    status: &StatusManager<'_>,
) -> Result<()> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    let Some(primary) = get_deployment(client, &name, &namespace).await? else {
        return Err(Error::NotFound(format!("primary deployment {}", name)));
    };

    let current = primary.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    if current == 0 {
        patch_replicas(client, &name, &namespace, REPLICAS_POINTER, 1).await?;
    }

    status
        .advance(ClusterEvent::ShutdownCleared, "primary scaled back up")
        .await?;
    Ok(())
}

/// Desired replica member names for a cluster spec: the primary plus
/// `replicas - 1` numbered members.
pub fn desired_replica_names(cluster_name: &str, replicas: i32) -> Vec<String> {
    (1..replicas)
        .map(|index| replica_deployment_name(cluster_name, index))
        .collect()
}

/// Reconcile the PgReplica set against the spec's replica count. Each
/// PgReplica materializes one deployment through the replica controller.
async fn reconcile_replica_set(client: &Client, cluster: &PgCluster) -> Result<()> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<PgReplica> = Api::namespaced(client.clone(), &namespace);

    let existing = api
        .list(&ListParams::default().labels(&cluster_selector(&name)))
        .await?;
    let existing_names: Vec<String> = existing.items.iter().map(|r| r.name_any()).collect();
    let desired = desired_replica_names(&name, cluster.spec.replicas);

    for replica_name in &desired {
        if existing_names.contains(replica_name) {
            continue;
        }
        let replica = PgReplica {
            metadata: ObjectMeta {
                name: Some(replica_name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(managed_labels(&name)),
                ..Default::default()
            },
            spec: PgReplicaSpec {
                cluster_name: name.clone(),
                storage: cluster.spec.replica_storage.clone(),
                node_name: None,
            },
            status: None,
        };
        match api.create(&PostParams::default(), &replica).await {
            Ok(_) => info!(cluster = %name, replica = %replica_name, "created replica resource"),
            Err(e) if already_exists(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }

    for replica_name in &existing_names {
        if desired.contains(replica_name) {
            continue;
        }
        match api.delete(replica_name, &DeleteParams::default()).await {
            Ok(_) => info!(cluster = %name, replica = %replica_name, "removed replica resource"),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Provision the cluster's derived objects: credentials secret, primary
/// deployment, services, and the replica set. Invoked when the
/// provisioning task is executed; every step skips work that already
/// exists.
pub async fn provision_cluster(client: &Client, cluster: &PgCluster) -> Result<()> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    info!(cluster = %name, namespace = %namespace, "provisioning cluster");

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    let secret_name = user_secret_name(cluster);
    if secrets.get_opt(&secret_name).await?.is_none() {
        let secret = generate_user_secret(cluster);
        match secrets.create(&PostParams::default(), &secret).await {
            Ok(_) => info!(cluster = %name, secret = %secret_name, "created credentials secret"),
            Err(e) if already_exists(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }

    if get_deployment(client, &name, &namespace).await?.is_none() {
        let primary = generate_primary_deployment(cluster, None);
        create_deployment(client, &primary, &namespace).await?;
    }

    let services: Api<Service> = Api::namespaced(client.clone(), &namespace);
    for service in [
        generate_primary_service(cluster),
        generate_replica_service(cluster),
    ] {
        let service_name = service.name_any();
        if services.get_opt(&service_name).await?.is_none() {
            match services.create(&PostParams::default(), &service).await {
                Ok(_) => info!(cluster = %name, service = %service_name, "created service"),
                Err(e) if already_exists(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    reconcile_replica_set(client, cluster).await
}

/// Promote a replica deployment to primary.
///
/// The target is read fresh, the three role labels are flipped in
/// memory, and only that delta is applied; any other deployment still
/// carrying the primary labels is then relabeled back to replica so
/// exactly one primary remains. Concurrent promotions are not fenced.
pub async fn promote_replica(
    client: &Client,
    cluster: &PgCluster,
    target_deployment: &str,
) -> Result<()> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    let Some(target) = get_deployment(client, target_deployment, &namespace).await? else {
        return Err(Error::NotFound(format!(
            "replica deployment {}",
            target_deployment
        )));
    };

    info!(
        cluster = %name,
        namespace = %namespace,
        target = %target_deployment,
        "promoting replica to primary"
    );
    promote_deployment(client, &target, &name).await?;

    // Relabel the former primary (and anything else still claiming the
    // role) back to replica.
    let primaries = list_deployments(client, &primary_selector(&name), &namespace).await?;
    for deployment in primaries {
        if deployment.name_any() == target_deployment {
            continue;
        }
        info!(
            cluster = %name,
            deployment = %deployment.name_any(),
            "demoting former primary"
        );
        demote_deployment(client, &deployment).await?;
    }

    Ok(())
}

/// Progress of a restore across idempotent re-drives.
#[derive(Debug, PartialEq, Eq)]
pub enum RestoreProgress {
    /// Old primary removal issued; recreation happens on the next drive
    /// once the deployment is gone.
    PrimaryRemoved,
    /// Replacement primary submitted with the recovery target attached.
    Submitted,
}

/// Recreate the primary from the backup repository, optionally rolling
/// forward to a point-in-time target.
///
/// Driven repeatedly until it reports [`RestoreProgress::Submitted`];
/// each phase is safe to repeat. Readiness of the restored primary is
/// observed by the cluster reconciler, which moves Restoring back to
/// Initialized.
pub async fn restore_cluster(
    client: &Client,
    cluster: &PgCluster,
    pitr_target: Option<&str>,
) -> Result<RestoreProgress> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let status = StatusManager::new(client, cluster, &namespace);

    let message = match pitr_target {
        Some(target) => format!("restoring to {}", target),
        None => "restoring from latest backup".to_string(),
    };

    let state = cluster
        .status
        .as_ref()
        .map(|s| s.state)
        .unwrap_or_default();
    match state {
        ClusterState::Initialized => {
            status
                .advance(ClusterEvent::RestoreRequested, &message)
                .await?;
            if get_deployment(client, &name, &namespace).await?.is_some() {
                delete_deployment(client, &name, &namespace).await?;
                return Ok(RestoreProgress::PrimaryRemoved);
            }
        }
        ClusterState::Restoring => {
            if let Some(primary) = get_deployment(client, &name, &namespace).await? {
                if primary.metadata.deletion_timestamp.is_some() {
                    // Old primary still draining; recreate next drive.
                    return Ok(RestoreProgress::PrimaryRemoved);
                }
                // Replacement already in place.
                return Ok(RestoreProgress::Submitted);
            }
        }
        other => {
            return Err(Error::ValidationError(format!(
                "restore is only valid for an initialized cluster, {} is {}",
                name, other
            )));
        }
    }

    // The replacement primary reuses the existing volumes by name and
    // carries the recovery target into its environment.
    let primary = generate_primary_deployment(cluster, pitr_target);
    create_deployment(client, &primary, &namespace).await?;

    Ok(RestoreProgress::Submitted)
}

/// Queue removal of a deleted cluster's derived objects. The heavy
/// lifting happens in the task controller so it survives restarts.
pub async fn cleanup_cluster(client: &Client, name: &str, namespace: &str) -> Result<()> {
    let mut parameters = BTreeMap::new();
    parameters.insert(TASK_PARAM_CLUSTER.to_string(), name.to_string());
    create_task(
        client,
        namespace,
        &format!("{}-rmdata", name),
        name,
        TaskType::RemoveData,
        parameters,
    )
    .await
}

/// Delete every deployment derived from a cluster. Volume and data
/// removal beyond that is executed by the backup tooling, not here.
pub async fn remove_cluster_data(client: &Client, name: &str, namespace: &str) -> Result<()> {
    let deployments = list_deployments(client, &cluster_selector(name), namespace).await?;
    for deployment in deployments {
        match delete_deployment(client, &deployment.name_any(), namespace).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Build a failover task targeting a replica deployment. Used by the
/// task-producing surfaces; executing it is the task controller's job.
pub fn failover_parameters(cluster_name: &str, target_deployment: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (TASK_PARAM_CLUSTER.to_string(), cluster_name.to_string()),
        (TASK_PARAM_TARGET.to_string(), target_deployment.to_string()),
    ])
}

/// Build a restore task, optionally with a point-in-time target.
pub fn restore_parameters(
    cluster_name: &str,
    pitr_target: Option<&str>,
) -> BTreeMap<String, String> {
    let mut parameters = BTreeMap::from([(
        TASK_PARAM_CLUSTER.to_string(),
        cluster_name.to_string(),
    )]);
    if let Some(target) = pitr_target {
        parameters.insert(TASK_PARAM_PITR_TARGET.to_string(), target.to_string());
    }
    parameters
}

/// Fetch a cluster by name.
pub async fn get_cluster(
    client: &Client,
    name: &str,
    namespace: &str,
) -> Result<Option<PgCluster>> {
    let api: Api<PgCluster> = Api::namespaced(client.clone(), namespace);
    Ok(api.get_opt(name).await?)
}

/// Labels for every object the reconciler itself creates, so the
/// ownership filter and cluster selectors match them.
fn managed_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_VENDOR.to_string(), LABEL_VENDOR_VALUE.to_string()),
        (LABEL_PG_CLUSTER.to_string(), cluster_name.to_string()),
    ])
}

async fn create_task(
    client: &Client,
    namespace: &str,
    task_name: &str,
    cluster_name: &str,
    task_type: TaskType,
    parameters: BTreeMap<String, String>,
) -> Result<()> {
    let api: Api<PgTask> = Api::namespaced(client.clone(), namespace);
    let task = PgTask {
        metadata: ObjectMeta {
            name: Some(task_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels(cluster_name)),
            ..Default::default()
        },
        spec: PgTaskSpec {
            task_type,
            parameters,
        },
        status: None,
    };

    match api.create(&PostParams::default(), &task).await {
        Ok(_) => {
            info!(task = %task_name, namespace = %namespace, %task_type, "created task");
            Ok(())
        }
        Err(e) if already_exists(&e) => {
            debug!(task = %task_name, namespace = %namespace, "task already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Update a task's status after execution.
pub async fn set_task_status(
    client: &Client,
    task: &PgTask,
    state: crate::crd::TaskState,
    message: &str,
) -> Result<()> {
    let namespace = task.namespace().unwrap_or_default();
    let api: Api<PgTask> = Api::namespaced(client.clone(), &namespace);

    let patch = serde_json::json!({
        "status": {
            "state": state,
            "message": message,
        }
    });

    api.patch_status(
        &task.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

fn already_exists(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(resp) if resp.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_replica_names() {
        assert!(desired_replica_names("c1", 1).is_empty());
        assert_eq!(
            desired_replica_names("c1", 3),
            vec!["c1-repl-1".to_string(), "c1-repl-2".to_string()]
        );
    }

    #[test]
    fn test_failover_parameters() {
        let params = failover_parameters("c1", "c1-repl-2");
        assert_eq!(params.get(TASK_PARAM_CLUSTER), Some(&"c1".to_string()));
        assert_eq!(params.get(TASK_PARAM_TARGET), Some(&"c1-repl-2".to_string()));
    }

    #[test]
    fn test_restore_parameters_with_target() {
        let params = restore_parameters("c1", Some("2026-01-02 03:04:05"));
        assert_eq!(
            params.get(TASK_PARAM_PITR_TARGET),
            Some(&"2026-01-02 03:04:05".to_string())
        );

        let params = restore_parameters("c1", None);
        assert!(!params.contains_key(TASK_PARAM_PITR_TARGET));
    }
}
