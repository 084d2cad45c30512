//! Namespace scope manager.
//!
//! Namespaces are the platform's multi-tenancy boundary. This component
//! watches the cluster-wide namespace resource and classifies each
//! namespace as in scope (carrying the vendor ownership label and this
//! installation's name label) or not. Namespaces entering scope get a
//! watch started on every tracked resource controller; namespaces leaving
//! via deletion get those watches torn down.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client, ResourceExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{LABEL_INSTALLATION, LABEL_VENDOR, LABEL_VENDOR_VALUE, OperatorConfig};
use crate::controller::error::{BackoffConfig, Result};
use crate::controller::generic::WatchTarget;
use crate::watch::{self, EventHandler};

/// Attempts made to establish a watch before giving up until the next
/// namespace event re-triggers setup.
const SETUP_ATTEMPTS: u32 = 3;

/// Starts and stops per-namespace resource watches as namespaces enter
/// and leave this installation's scope.
pub struct NamespaceScopeManager {
    client: Client,
    config: Arc<OperatorConfig>,
    /// Tracked controllers, in the fixed order watches are started in.
    /// The order only matters for log readability.
    targets: Vec<Arc<dyn WatchTarget>>,
    backoff: BackoffConfig,
    started: Mutex<HashSet<String>>,
}

impl NamespaceScopeManager {
    pub fn new(
        client: Client,
        config: Arc<OperatorConfig>,
        targets: Vec<Arc<dyn WatchTarget>>,
    ) -> Self {
        Self {
            client,
            config,
            targets,
            backoff: BackoffConfig::default(),
            started: Mutex::new(HashSet::new()),
        }
    }

    /// Run the namespace watch until the signal fires.
    ///
    /// Failing to establish this first watch is a configuration problem
    /// and is returned to the caller as fatal; everything downstream is
    /// retried instead.
    pub async fn run(self: Arc<Self>, signal: CancellationToken) -> Result<()> {
        info!("starting namespace scope manager");

        let api: Api<Namespace> = Api::all(self.client.clone());
        let handler: Arc<dyn EventHandler<Namespace>> = self.clone();

        // Namespace events are rare; rely on watch delivery, no resync.
        let handle = watch::start(api, Duration::ZERO, handler, &signal).await?;

        signal.cancelled().await;
        handle.stop().await;
        info!("namespace scope manager stopped");
        Ok(())
    }

    fn in_scope(&self, namespace: &Namespace) -> bool {
        namespace_in_scope(namespace, &self.config.installation_name)
    }

    /// Start watches for every tracked kind in the fixed order.
    async fn start_watches(&self, namespace: &str) {
        for target in &self.targets {
            self.setup_with_retry(target.as_ref(), namespace).await;
        }
        self.started.lock().await.insert(namespace.to_string());
    }

    async fn setup_with_retry(&self, target: &dyn WatchTarget, namespace: &str) {
        for attempt in 0..SETUP_ATTEMPTS {
            match target.setup_watch(namespace).await {
                Ok(()) => return,
                Err(e) => {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    debug!(
                        kind = target.kind(),
                        namespace = %namespace,
                        attempt,
                        "watch setup failed, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        // The next add/update event for this namespace retriggers setup.
        error!(
            kind = target.kind(),
            namespace = %namespace,
            "giving up establishing watch after {} attempts",
            SETUP_ATTEMPTS
        );
    }

    async fn stop_watches(&self, namespace: &str) {
        for target in &self.targets {
            target.stop_watch(namespace).await;
        }
        self.started.lock().await.remove(namespace);
    }
}

/// A namespace is in scope iff it carries the vendor ownership label and
/// an installation-name label matching this controller instance.
pub fn namespace_in_scope(namespace: &Namespace, installation_name: &str) -> bool {
    let labels = namespace.labels();
    labels.get(LABEL_VENDOR).map(String::as_str) == Some(LABEL_VENDOR_VALUE)
        && labels.get(LABEL_INSTALLATION).map(String::as_str) == Some(installation_name)
}

#[async_trait]
impl EventHandler<Namespace> for NamespaceScopeManager {
    async fn on_add(&self, obj: &Namespace) {
        let name = obj.name_any();
        if !self.in_scope(obj) {
            debug!(namespace = %name, "skipping namespace outside installation scope");
            return;
        }
        info!(namespace = %name, "namespace entered scope");
        self.start_watches(&name).await;
    }

    async fn on_update(&self, _old: &Namespace, new: &Namespace) {
        let name = new.name_any();
        if !self.in_scope(new) {
            debug!(namespace = %name, "skipping namespace outside installation scope");
            return;
        }
        // Idempotent per controller: re-delivery starts nothing twice.
        self.start_watches(&name).await;
    }

    async fn on_delete(&self, obj: &Namespace) {
        let name = obj.name_any();
        if obj.labels().get(LABEL_VENDOR).map(String::as_str) != Some(LABEL_VENDOR_VALUE) {
            debug!(namespace = %name, "deleted namespace was not operator managed");
            return;
        }
        info!(namespace = %name, "operator namespace deleted, stopping watches");
        if self.started.lock().await.contains(&name) {
            self.stop_watches(&name).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::error::Error;
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    fn namespace(name: &str, labels: &[(&str, &str)]) -> Namespace {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_in_scope_requires_both_labels() {
        let ns = namespace(
            "pgdata",
            &[
                (LABEL_VENDOR, LABEL_VENDOR_VALUE),
                (LABEL_INSTALLATION, "prod-east"),
            ],
        );
        assert!(namespace_in_scope(&ns, "prod-east"));

        // Wrong installation
        assert!(!namespace_in_scope(&ns, "prod-west"));

        // Vendor label alone is not enough
        let vendor_only = namespace("pgdata", &[(LABEL_VENDOR, LABEL_VENDOR_VALUE)]);
        assert!(!namespace_in_scope(&vendor_only, "prod-east"));

        // Installation label alone is not enough
        let install_only = namespace("pgdata", &[(LABEL_INSTALLATION, "prod-east")]);
        assert!(!namespace_in_scope(&install_only, "prod-east"));

        // Foreign vendor value
        let foreign = namespace(
            "pgdata",
            &[(LABEL_VENDOR, "other"), (LABEL_INSTALLATION, "prod-east")],
        );
        assert!(!namespace_in_scope(&foreign, "prod-east"));

        let unlabeled = namespace("pgdata", &[]);
        assert!(!namespace_in_scope(&unlabeled, "prod-east"));
    }

    /// Records setup/stop calls per kind so scope transitions can be
    /// asserted without an API server.
    struct FakeTarget {
        kind: &'static str,
        calls: Arc<StdMutex<Vec<String>>>,
        fail_first: StdMutex<bool>,
    }

    #[async_trait]
    impl WatchTarget for FakeTarget {
        fn kind(&self) -> &'static str {
            self.kind
        }

        async fn setup_watch(&self, namespace: &str) -> Result<()> {
            let mut fail = self.fail_first.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(Error::WatchSetupError {
                    kind: self.kind,
                    namespace: namespace.to_string(),
                    message: "list failed".to_string(),
                });
            }
            drop(fail);
            self.calls
                .lock()
                .unwrap()
                .push(format!("setup {} {}", self.kind, namespace));
            Ok(())
        }

        async fn stop_watch(&self, namespace: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("stop {} {}", self.kind, namespace));
        }
    }

    fn manager_with_targets(
        kinds: &[&'static str],
        fail_first: bool,
    ) -> (Arc<NamespaceScopeManager>, Arc<StdMutex<Vec<String>>>) {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let targets: Vec<Arc<dyn WatchTarget>> = kinds
            .iter()
            .map(|kind| {
                Arc::new(FakeTarget {
                    kind,
                    calls: calls.clone(),
                    fail_first: StdMutex::new(fail_first),
                }) as Arc<dyn WatchTarget>
            })
            .collect();

        // Client construction is deferred until a watch is started, so a
        // lazy config-less client is safe for handler-level tests.
        let client = kube::Client::try_from(
            kube::Config::new("http://localhost:8080".parse().unwrap()),
        )
        .unwrap();
        let config = Arc::new(OperatorConfig::new("prod-east", Duration::ZERO));
        (
            Arc::new(NamespaceScopeManager::new(client, config, targets)),
            calls,
        )
    }

    #[tokio::test]
    async fn test_in_scope_namespace_starts_watches_in_order() {
        let (manager, calls) = manager_with_targets(&["pod", "job", "cluster"], false);
        let ns = namespace(
            "tenant-a",
            &[
                (LABEL_VENDOR, LABEL_VENDOR_VALUE),
                (LABEL_INSTALLATION, "prod-east"),
            ],
        );

        manager.on_add(&ns).await;

        let recorded = calls.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec![
                "setup pod tenant-a",
                "setup job tenant-a",
                "setup cluster tenant-a"
            ]
        );
    }

    #[tokio::test]
    async fn test_out_of_scope_namespace_starts_nothing() {
        let (manager, calls) = manager_with_targets(&["pod"], false);
        let ns = namespace("tenant-b", &[(LABEL_VENDOR, "other")]);

        manager.on_add(&ns).await;
        manager.on_update(&ns, &ns).await;

        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_stops_started_watches() {
        let (manager, calls) = manager_with_targets(&["pod", "cluster"], false);
        let ns = namespace(
            "tenant-a",
            &[
                (LABEL_VENDOR, LABEL_VENDOR_VALUE),
                (LABEL_INSTALLATION, "prod-east"),
            ],
        );

        manager.on_add(&ns).await;
        manager.on_delete(&ns).await;

        let recorded = calls.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec![
                "setup pod tenant-a",
                "setup cluster tenant-a",
                "stop pod tenant-a",
                "stop cluster tenant-a"
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_of_never_started_namespace_is_noop() {
        let (manager, calls) = manager_with_targets(&["pod"], false);
        let ns = namespace(
            "tenant-c",
            &[
                (LABEL_VENDOR, LABEL_VENDOR_VALUE),
                (LABEL_INSTALLATION, "prod-east"),
            ],
        );

        manager.on_delete(&ns).await;

        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_setup_retries_after_transient_failure() {
        let (manager, calls) = manager_with_targets(&["pod"], true);
        let ns = namespace(
            "tenant-a",
            &[
                (LABEL_VENDOR, LABEL_VENDOR_VALUE),
                (LABEL_INSTALLATION, "prod-east"),
            ],
        );

        manager.on_add(&ns).await;

        // First attempt fails, second succeeds
        let recorded = calls.lock().unwrap().clone();
        assert_eq!(recorded, vec!["setup pod tenant-a"]);
    }
}
