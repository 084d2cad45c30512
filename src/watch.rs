//! Watch streams over one resource kind in one namespace.
//!
//! A stream performs an initial full list to seed a local cache, then
//! consumes incremental watch events. Transient connection loss is
//! retried internally with backoff and never surfaces to the consumer;
//! an optional resync period synthetically re-delivers update
//! notifications for every cached object so consumers self-heal from
//! missed or mis-processed events.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controller::error::Result;

/// Kind-specific event callbacks plugged into a watch stream.
#[async_trait]
pub trait EventHandler<K>: Send + Sync {
    async fn on_add(&self, obj: &K);
    async fn on_update(&self, old: &K, new: &K);
    async fn on_delete(&self, obj: &K);
}

/// Handle to one live watch. Dropping the handle does not stop the
/// stream; call [`WatchHandle::stop`] or cancel the parent token.
pub struct WatchHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Cancel the stream and wait for its task to drain.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }

    #[cfg(test)]
    pub(crate) fn dummy() -> Self {
        Self {
            token: CancellationToken::new(),
            task: tokio::spawn(async {}),
        }
    }
}

/// Start a watch stream.
///
/// The initial list runs before the background task is spawned: if it
/// fails, start fails and the caller retries with backoff. Once running,
/// the stream only ends on cancellation.
pub async fn start<K>(
    api: Api<K>,
    resync_period: Duration,
    handler: Arc<dyn EventHandler<K>>,
    parent: &CancellationToken,
) -> Result<WatchHandle>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let seed = api.list(&ListParams::default()).await?.items;

    let token = parent.child_token();
    let task = tokio::spawn(run_watch(
        api,
        seed,
        resync_period,
        handler,
        token.clone(),
    ));

    Ok(WatchHandle { token, task })
}

/// Event loop for one stream. Maintains the local cache, translating raw
/// watcher events into add/update/delete notifications, re-listing
/// deletions missed during a watch outage, and firing resync ticks.
async fn run_watch<K>(
    api: Api<K>,
    seed: Vec<K>,
    resync_period: Duration,
    handler: Arc<dyn EventHandler<K>>,
    token: CancellationToken,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut cache: HashMap<String, K> = HashMap::new();

    for obj in seed {
        handler.on_add(&obj).await;
        cache.insert(obj.name_any(), obj);
    }

    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    let mut resync = if resync_period.is_zero() {
        None
    } else {
        let mut interval = tokio::time::interval(resync_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Swallow the immediate first tick; the seed list already
        // delivered every object.
        interval.tick().await;
        Some(interval)
    };

    // Names seen during an in-flight re-list, used to detect deletions
    // that happened while the watch was down.
    let mut relist: Option<Vec<String>> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("watch stream cancelled");
                break;
            }
            _ = tick(&mut resync) => {
                debug!(objects = cache.len(), "resync re-delivering cached objects");
                for obj in cache.values() {
                    handler.on_update(obj, obj).await;
                }
            }
            event = stream.next() => {
                match event {
                    Some(Ok(ev)) => {
                        dispatch(ev, &mut cache, &mut relist, handler.as_ref()).await;
                    }
                    Some(Err(e)) => {
                        // The watcher retries internally; consumers never
                        // see transient errors.
                        warn!("watch error (will retry): {}", e);
                    }
                    None => {
                        warn!("watch stream ended unexpectedly");
                        break;
                    }
                }
            }
        }
    }
}

async fn tick(resync: &mut Option<tokio::time::Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn dispatch<K>(
    event: Event<K>,
    cache: &mut HashMap<String, K>,
    relist: &mut Option<Vec<String>>,
    handler: &dyn EventHandler<K>,
) where
    K: Resource + Clone,
{
    match event {
        Event::Init => {
            *relist = Some(Vec::new());
        }
        Event::InitApply(obj) => {
            if let Some(seen) = relist.as_mut() {
                seen.push(obj.name_any());
            }
            apply(obj, cache, handler).await;
        }
        Event::InitDone => {
            // Objects deleted during an outage are absent from the
            // re-list; emit deletes for them so consumers converge.
            if let Some(seen) = relist.take() {
                let gone: Vec<String> = cache
                    .keys()
                    .filter(|name| !seen.contains(*name))
                    .cloned()
                    .collect();
                for name in gone {
                    if let Some(obj) = cache.remove(&name) {
                        handler.on_delete(&obj).await;
                    }
                }
            }
        }
        Event::Apply(obj) => {
            apply(obj, cache, handler).await;
        }
        Event::Delete(obj) => {
            cache.remove(&obj.name_any());
            handler.on_delete(&obj).await;
        }
    }
}

async fn apply<K>(obj: K, cache: &mut HashMap<String, K>, handler: &dyn EventHandler<K>)
where
    K: Resource + Clone,
{
    match cache.insert(obj.name_any(), obj.clone()) {
        Some(old) => handler.on_update(&old, &obj).await,
        None => handler.on_add(&obj).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use kube::core::ObjectMeta;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventHandler<Pod> for Recorder {
        async fn on_add(&self, obj: &Pod) {
            self.events.lock().unwrap().push(format!("add {}", obj.name_any()));
        }
        async fn on_update(&self, _old: &Pod, new: &Pod) {
            self.events.lock().unwrap().push(format!("update {}", new.name_any()));
        }
        async fn on_delete(&self, obj: &Pod) {
            self.events.lock().unwrap().push(format!("delete {}", obj.name_any()));
        }
    }

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_apply_distinguishes_add_from_update() {
        let recorder = Recorder::default();
        let mut cache = HashMap::new();

        apply(pod("a"), &mut cache, &recorder).await;
        apply(pod("a"), &mut cache, &recorder).await;

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["add a", "update a"]);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_relist_emits_deletes_for_missing_objects() {
        let recorder = Recorder::default();
        let mut cache = HashMap::new();
        let mut relist = None;

        // Two objects known before the outage
        apply(pod("a"), &mut cache, &recorder).await;
        apply(pod("b"), &mut cache, &recorder).await;

        // Re-list only returns "a"
        dispatch(Event::Init, &mut cache, &mut relist, &recorder).await;
        dispatch(Event::InitApply(pod("a")), &mut cache, &mut relist, &recorder).await;
        dispatch(Event::InitDone, &mut cache, &mut relist, &recorder).await;

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["add a", "add b", "update a", "delete b"]);
        assert!(cache.contains_key("a"));
        assert!(!cache.contains_key("b"));
    }

    #[tokio::test]
    async fn test_delete_removes_from_cache() {
        let recorder = Recorder::default();
        let mut cache = HashMap::new();
        let mut relist = None;

        apply(pod("a"), &mut cache, &recorder).await;
        dispatch(Event::Delete(pod("a")), &mut cache, &mut relist, &recorder).await;

        assert!(cache.is_empty());
        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["add a", "delete a"]);
    }
}
