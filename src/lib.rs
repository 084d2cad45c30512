pub mod config;
pub mod controller;
pub mod crd;
pub mod resources;
pub mod watch;

pub use config::OperatorConfig;
pub use controller::{Error, Result};
pub use crd::{PgCluster, PgPolicy, PgReplica, PgTask};

use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use tokio_util::sync::CancellationToken;

use controller::{
    ClusterHandler, JobHandler, NamespaceScopeManager, PodHandler, PolicyHandler,
    ReplicaHandler, ResourceController, TaskHandler, WatchTarget,
};

/// Run the operator until the signal fires.
///
/// Builds one resource controller per tracked kind, hands the fixed
/// ordered list to the namespace scope manager, and drives the
/// cluster-wide namespace watch. Per-namespace watches come and go as
/// namespaces enter and leave this installation's scope.
///
/// The only fatal error is failing to establish the namespace watch
/// itself; everything downstream is retried from watch events.
pub async fn run_operator(
    client: Client,
    config: OperatorConfig,
    signal: CancellationToken,
) -> Result<()> {
    let config = Arc::new(config);

    let pods = Arc::new(ResourceController::<Pod>::new(
        "pod",
        client.clone(),
        config.clone(),
        Arc::new(PodHandler::new(client.clone())),
    ));
    let jobs = Arc::new(ResourceController::<Job>::new(
        "job",
        client.clone(),
        config.clone(),
        Arc::new(JobHandler::new(client.clone())),
    ));
    let policies = Arc::new(ResourceController::<PgPolicy>::new(
        "pgpolicy",
        client.clone(),
        config.clone(),
        Arc::new(PolicyHandler::new(client.clone())),
    ));
    let replicas = Arc::new(ResourceController::<PgReplica>::new(
        "pgreplica",
        client.clone(),
        config.clone(),
        Arc::new(ReplicaHandler::new(client.clone())),
    ));
    let clusters = Arc::new(ResourceController::<PgCluster>::new(
        "pgcluster",
        client.clone(),
        config.clone(),
        Arc::new(ClusterHandler::new(client.clone())),
    ));
    let tasks = Arc::new(ResourceController::<PgTask>::new(
        "pgtask",
        client.clone(),
        config.clone(),
        Arc::new(TaskHandler::new(client.clone())),
    ));

    let targets: Vec<Arc<dyn WatchTarget>> = vec![
        pods.clone(),
        jobs.clone(),
        policies.clone(),
        replicas.clone(),
        clusters.clone(),
        tasks.clone(),
    ];

    let controller_handles = vec![
        spawn_controller(pods, signal.clone()),
        spawn_controller(jobs, signal.clone()),
        spawn_controller(policies, signal.clone()),
        spawn_controller(replicas, signal.clone()),
        spawn_controller(clusters, signal.clone()),
        spawn_controller(tasks, signal.clone()),
    ];

    let scope = Arc::new(NamespaceScopeManager::new(
        client,
        config,
        targets,
    ));

    let result = scope.run(signal.clone()).await;
    if result.is_err() {
        // Startup failure: release the per-kind controllers too.
        signal.cancel();
    }

    for handle in controller_handles {
        let _ = handle.await;
    }

    result
}

fn spawn_controller<K>(
    controller: Arc<ResourceController<K>>,
    signal: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
    <K as kube::Resource>::DynamicType: Default,
{
    tokio::spawn(async move {
        controller.run(signal).await;
    })
}
