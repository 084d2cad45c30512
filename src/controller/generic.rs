//! Generic per-kind resource controller.
//!
//! A controller owns zero or more watch streams for a single resource
//! kind, one per namespace it has been told to track. Events for objects
//! that do not carry the operator's ownership label are dropped before
//! they reach the kind-specific handler, even if the watch scope were
//! ever misconfigured.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{LABEL_VENDOR, LABEL_VENDOR_VALUE, OperatorConfig};
use crate::controller::error::{Error, Result};
use crate::watch::{self, EventHandler, WatchHandle};

/// A controller the namespace scope manager can start watches on. The
/// scope manager holds a fixed, explicit list of these.
#[async_trait]
pub trait WatchTarget: Send + Sync {
    /// Resource kind, for logs.
    fn kind(&self) -> &'static str;

    /// Start watching a namespace. Idempotent.
    async fn setup_watch(&self, namespace: &str) -> Result<()>;

    /// Stop watching a namespace. No-op when absent.
    async fn stop_watch(&self, namespace: &str);
}

/// Owns the per-namespace watch streams for one resource kind.
pub struct ResourceController<K> {
    kind: &'static str,
    client: Client,
    config: Arc<OperatorConfig>,
    handler: Arc<dyn EventHandler<K>>,
    watches: Mutex<HashMap<String, WatchHandle>>,
    token: CancellationToken,
}

impl<K> ResourceController<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    <K as Resource>::DynamicType: Default,
{
    pub fn new(
        kind: &'static str,
        client: Client,
        config: Arc<OperatorConfig>,
        handler: Arc<dyn EventHandler<K>>,
    ) -> Self {
        Self {
            kind,
            client,
            config,
            handler: Arc::new(OwnershipFilter { inner: handler }),
            watches: Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
        }
    }

    /// Block until the signal fires, then stop every owned stream.
    pub async fn run(&self, signal: CancellationToken) {
        signal.cancelled().await;
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        self.token.cancel();
        let mut watches = self.watches.lock().await;
        for (namespace, handle) in watches.drain() {
            handle.stop().await;
            debug!(kind = self.kind, namespace = %namespace, "stopped watch");
        }
    }
}

#[async_trait]
impl<K> WatchTarget for ResourceController<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
    <K as Resource>::DynamicType: Default,
{
    fn kind(&self) -> &'static str {
        self.kind
    }

    async fn setup_watch(&self, namespace: &str) -> Result<()> {
        let mut watches = self.watches.lock().await;

        // At most one live watch per (kind, namespace) pair.
        if watches.contains_key(namespace) {
            debug!(
                kind = self.kind,
                namespace = %namespace,
                "watch already established, skipping"
            );
            return Ok(());
        }

        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let handle = watch::start(
            api,
            self.config.resync_period,
            self.handler.clone(),
            &self.token,
        )
        .await
        .map_err(|e| Error::WatchSetupError {
            kind: self.kind,
            namespace: namespace.to_string(),
            message: e.to_string(),
        })?;

        info!(kind = self.kind, namespace = %namespace, "watch established");
        watches.insert(namespace.to_string(), handle);
        Ok(())
    }

    async fn stop_watch(&self, namespace: &str) {
        let handle = self.watches.lock().await.remove(namespace);
        match handle {
            Some(handle) => {
                handle.stop().await;
                info!(kind = self.kind, namespace = %namespace, "watch stopped");
            }
            None => {
                debug!(
                    kind = self.kind,
                    namespace = %namespace,
                    "no watch to stop"
                );
            }
        }
    }
}

/// Drops events for objects not owned by this operator.
struct OwnershipFilter<K> {
    inner: Arc<dyn EventHandler<K>>,
}

fn is_owned<K: Resource>(obj: &K) -> bool {
    obj.labels().get(LABEL_VENDOR).map(String::as_str) == Some(LABEL_VENDOR_VALUE)
}

#[async_trait]
impl<K> EventHandler<K> for OwnershipFilter<K>
where
    K: Resource + Send + Sync,
{
    async fn on_add(&self, obj: &K) {
        if is_owned(obj) {
            self.inner.on_add(obj).await;
        } else {
            debug!(name = %obj.name_any(), "ignoring unowned object");
        }
    }

    async fn on_update(&self, old: &K, new: &K) {
        if is_owned(new) {
            self.inner.on_update(old, new).await;
        } else {
            debug!(name = %new.name_any(), "ignoring unowned object");
        }
    }

    async fn on_delete(&self, obj: &K) {
        if is_owned(obj) {
            self.inner.on_delete(obj).await;
        } else {
            debug!(name = %obj.name_any(), "ignoring unowned object");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        names: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler<Pod> for Recorder {
        async fn on_add(&self, obj: &Pod) {
            self.names.lock().unwrap().push(obj.name_any());
        }
        async fn on_update(&self, _old: &Pod, new: &Pod) {
            self.names.lock().unwrap().push(new.name_any());
        }
        async fn on_delete(&self, obj: &Pod) {
            self.names.lock().unwrap().push(obj.name_any());
        }
    }

    fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn lazy_controller() -> ResourceController<Pod> {
        // Client construction is lazy; nothing here contacts a server.
        let client = kube::Client::try_from(
            kube::Config::new("http://localhost:8080".parse().unwrap()),
        )
        .unwrap();
        let config = Arc::new(OperatorConfig::new(
            "prod-east",
            std::time::Duration::ZERO,
        ));
        ResourceController::new("pod", client, config, Arc::new(Recorder::default()))
    }

    #[tokio::test]
    async fn test_setup_watch_is_idempotent_per_namespace() {
        let controller = lazy_controller();
        controller
            .watches
            .lock()
            .await
            .insert("tenant-a".to_string(), WatchHandle::dummy());

        // A live watch for the namespace short-circuits; no second
        // stream is created.
        controller.setup_watch("tenant-a").await.unwrap();
        assert_eq!(controller.watches.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_watch_of_absent_namespace_is_noop() {
        let controller = lazy_controller();
        controller
            .watches
            .lock()
            .await
            .insert("tenant-a".to_string(), WatchHandle::dummy());

        controller.stop_watch("tenant-b").await;
        assert_eq!(controller.watches.lock().await.len(), 1);

        controller.stop_watch("tenant-a").await;
        assert!(controller.watches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_ownership_filter_drops_unowned_objects() {
        let recorder = Arc::new(Recorder::default());
        let filter = OwnershipFilter {
            inner: recorder.clone() as Arc<dyn EventHandler<Pod>>,
        };

        let owned = pod("owned", &[(LABEL_VENDOR, LABEL_VENDOR_VALUE)]);
        let foreign = pod("foreign", &[(LABEL_VENDOR, "someone-else")]);
        let unlabeled = pod("unlabeled", &[]);

        filter.on_add(&owned).await;
        filter.on_add(&foreign).await;
        filter.on_update(&unlabeled, &unlabeled).await;
        filter.on_delete(&foreign).await;
        filter.on_delete(&owned).await;

        let names = recorder.names.lock().unwrap().clone();
        assert_eq!(names, vec!["owned", "owned"]);
    }
}
