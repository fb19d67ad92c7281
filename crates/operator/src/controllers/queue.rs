//! Per-key serialized event dispatch
//!
//! Takes incoming watch events and routes them to one worker task per
//! object key, so at most one reconcile is in flight for a given resource
//! while distinct resources reconcile concurrently. Event order for the
//! same key is preserved by the per-key channel. A deletion flips the
//! key's cancellation channel before it is enqueued, waking any
//! in-flight apply immediately.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::ListParams;
use kube::{Api, Resource, ResourceExt};
use kube_runtime::watcher::{self, Event};
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Reconcile callbacks for one resource kind.
#[async_trait]
pub(crate) trait EventHandler<K>: Send + Sync + 'static {
    /// Handle an applied (created or updated) object. The `deleted`
    /// channel flips to `true` as soon as a deletion for the same key is
    /// observed.
    async fn applied(&self, obj: K, deleted: watch::Receiver<bool>);

    /// Handle a deleted object. Runs after any in-flight `applied` for the
    /// same key has returned or been cancelled.
    async fn deleted(&self, obj: K);
}

enum Msg<K> {
    Applied(K),
    Deleted(K),
}

struct Handler<K> {
    sender: mpsc::Sender<Msg<K>>,
    cancel: watch::Sender<bool>,
}

struct Queue<K> {
    worker: Arc<dyn EventHandler<K>>,
    handlers: HashMap<String, Handler<K>>,
}

impl<K> Queue<K>
where
    K: Resource + Clone + Send + 'static,
{
    fn new(worker: Arc<dyn EventHandler<K>>) -> Self {
        Queue {
            worker,
            handlers: HashMap::new(),
        }
    }

    fn spawn_handler(&self) -> Handler<K> {
        let (sender, mut receiver) = mpsc::channel::<Msg<K>>(16);
        let (cancel, deleted) = watch::channel(false);
        let worker = Arc::clone(&self.worker);
        tokio::spawn(async move {
            while let Some(msg) = receiver.recv().await {
                match msg {
                    Msg::Applied(obj) => worker.applied(obj, deleted.clone()).await,
                    Msg::Deleted(obj) => {
                        worker.deleted(obj).await;
                        break;
                    }
                }
            }
        });
        Handler { sender, cancel }
    }

    async fn enqueue(&mut self, event: Event<K>) {
        match event {
            Event::Applied(obj) => self.dispatch(Msg::Applied(obj)).await,
            Event::Deleted(obj) => {
                let key = object_key(&obj);
                if let Some(handler) = self.handlers.remove(&key) {
                    let _ = handler.cancel.send(true);
                    if handler.sender.send(Msg::Deleted(obj)).await.is_err() {
                        warn!(%key, "Worker gone before deletion could be delivered");
                    }
                } else {
                    // Nothing in flight for this key; run the cleanup on a
                    // fresh worker so remote teardown still happens.
                    let handler = self.spawn_handler();
                    let _ = handler.sender.send(Msg::Deleted(obj)).await;
                }
            }
            Event::Restarted(objs) => {
                for obj in objs {
                    self.dispatch(Msg::Applied(obj)).await;
                }
            }
        }
    }

    async fn dispatch(&mut self, msg: Msg<K>) {
        let obj = match &msg {
            Msg::Applied(obj) | Msg::Deleted(obj) => obj,
        };
        let key = object_key(obj);
        if !self.handlers.contains_key(&key) {
            debug!(%key, "Creating event handler");
            self.handlers.insert(key.clone(), self.spawn_handler());
        }
        let handler = self.handlers.get(&key).unwrap();
        if handler.sender.send(msg).await.is_err() {
            warn!(%key, "Event handler channel closed, dropping event");
            self.handlers.remove(&key);
        }
    }
}

fn object_key<K: Resource>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.meta().namespace.as_deref().unwrap_or("default"),
        obj.name()
    )
}

/// Watch a resource kind and feed its events through the per-key queue
/// until the watch stream ends.
pub(crate) async fn run_controller<K>(api: Api<K>, handler: Arc<dyn EventHandler<K>>)
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let mut queue = Queue::new(handler);
    let mut stream = watcher::watcher(api, ListParams::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => queue.enqueue(event).await,
            Err(e) => warn!(error = %e, "Watch error, stream will resume"),
        }
    }
}

/// Run a future unless the object is deleted first. Returns `None` when
/// the deletion won; the deletion wakes this immediately rather than on
/// a poll tick.
pub(crate) async fn unless_deleted<F, T>(mut deleted: watch::Receiver<bool>, fut: F) -> Option<T>
where
    F: Future<Output = T>,
{
    if *deleted.borrow() {
        return None;
    }
    tokio::select! {
        result = fut => Some(result),
        _ = wait_deleted(&mut deleted) => None,
    }
}

async fn wait_deleted(deleted: &mut watch::Receiver<bool>) {
    loop {
        if *deleted.borrow() {
            return;
        }
        // A closed channel means the queue itself is gone; stop the work.
        if deleted.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Recording {
        applied: AtomicUsize,
        deleted: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Recording {
                applied: AtomicUsize::new(0),
                deleted: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }
    }

    struct RecordingHandler(Arc<Recording>);

    #[async_trait]
    impl EventHandler<ConfigMap> for RecordingHandler {
        async fn applied(&self, _obj: ConfigMap, _deleted: watch::Receiver<bool>) {
            let now = self.0.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.0.applied.fetch_add(1, Ordering::SeqCst);
        }

        async fn deleted(&self, _obj: ConfigMap) {
            self.0.deleted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn same_key_events_are_serialized() {
        let recording = Recording::new();
        let mut queue = Queue::new(
            Arc::new(RecordingHandler(Arc::clone(&recording))) as Arc<dyn EventHandler<ConfigMap>>
        );

        for _ in 0..4 {
            queue.enqueue(Event::Applied(config_map("one"))).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(recording.applied.load(Ordering::SeqCst), 4);
        assert_eq!(recording.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deletion_reaches_a_key_without_history() {
        let recording = Recording::new();
        let mut queue = Queue::new(
            Arc::new(RecordingHandler(Arc::clone(&recording))) as Arc<dyn EventHandler<ConfigMap>>
        );
        queue.enqueue(Event::Deleted(config_map("ghost"))).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recording.deleted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unless_deleted_cancels_immediately() {
        let (cancel, deleted) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = cancel.send(true);
        });
        let started = tokio::time::Instant::now();
        let outcome = unless_deleted(deleted, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "finished"
        })
        .await;
        assert_eq!(outcome, None);
        // The wake comes from the channel flip, not a poll tick.
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn already_deleted_short_circuits() {
        let (cancel, deleted) = watch::channel(false);
        cancel.send(true).unwrap();
        let outcome = unless_deleted(deleted, async { "finished" }).await;
        assert_eq!(outcome, None);
    }
}
