//! Ekko store: per-kind informers keeping an in-RAM snapshot in step with the
//! external store, and notifying handlers after each published change.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use ekko_core::{Notification, Resource, ResourceIdentity};
use ekko_kubehub::ResourceApi;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod ingest;
mod reflector;

pub use ingest::Snapshot;

use ingest::{Delta, SnapshotBuilder};
use reflector::Reflector;

/// Receives cache notifications. Called from the ingest task after the
/// snapshot holding the change is visible through [`Cache::get`]; keep it quick.
pub trait EventHandler<R>: Send + Sync {
    fn on_event(&self, n: &Notification<R>);
}

impl<R, F> EventHandler<R> for F
where
    F: Fn(&Notification<R>) + Send + Sync,
{
    fn on_event(&self, n: &Notification<R>) {
        self(n)
    }
}

/// Read handle on one kind's snapshot. Never contacts the store.
pub struct Cache<R> {
    snap: Arc<ArcSwap<Snapshot<R>>>,
}

impl<R> Clone for Cache<R> {
    fn clone(&self) -> Self {
        Self { snap: Arc::clone(&self.snap) }
    }
}

impl<R: Resource> Cache<R> {
    fn new() -> Self {
        Self { snap: Arc::new(ArcSwap::from_pointee(Snapshot::default())) }
    }

    pub fn get(&self, id: &ResourceIdentity) -> Option<Arc<R>> {
        self.snap.load().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<R>> {
        self.snap.load().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snap.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Becomes true once the initial list is applied and the watch is open.
#[derive(Clone)]
pub struct SyncGate {
    kind: &'static str,
    rx: watch::Receiver<bool>,
}

impl SyncGate {
    async fn wait_until(mut self, deadline: tokio::time::Instant) -> bool {
        matches!(tokio::time::timeout_at(deadline, self.rx.wait_for(|s| *s)).await, Ok(Ok(_)))
    }
}

/// Wait until every gate is synced. False on timeout or cancellation.
pub async fn wait_for_cache_sync(
    timeout: Duration,
    cancel: &CancellationToken,
    gates: impl IntoIterator<Item = SyncGate>,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    for gate in gates {
        let kind = gate.kind;
        let ok = tokio::select! {
            _ = cancel.cancelled() => false,
            ok = gate.wait_until(deadline) => ok,
        };
        if !ok {
            info!(kind, timeout_ms = timeout.as_millis() as u64, "cache did not sync");
            return false;
        }
    }
    true
}

#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// `None` watches all namespaces.
    pub namespace: Option<String>,
    /// Full relist period; zero disables it.
    pub resync: Duration,
    pub watch_backoff_max: Duration,
    /// Capacity of the reflector -> ingest channel and max batch size.
    pub channel_cap: usize,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync: Duration::from_secs(300),
            watch_backoff_max: Duration::from_secs(30),
            channel_cap: 1024,
        }
    }
}

/// Keeps one kind's cache in step with the store.
///
/// Register handlers, then [`Informer::start`]. The cache handle is available
/// before start so handlers of other kinds can hold it.
pub struct Informer<R: Resource> {
    api: Arc<dyn ResourceApi<R>>,
    config: InformerConfig,
    cache: Cache<R>,
    handlers: Vec<Arc<dyn EventHandler<R>>>,
    synced_tx: Arc<watch::Sender<bool>>,
    synced_rx: watch::Receiver<bool>,
}

impl<R: Resource> Informer<R> {
    pub fn new(api: Arc<dyn ResourceApi<R>>, config: InformerConfig) -> Self {
        let (synced_tx, synced_rx) = watch::channel(false);
        Self { api, config, cache: Cache::new(), handlers: Vec::new(), synced_tx: Arc::new(synced_tx), synced_rx }
    }

    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler<R>>) {
        self.handlers.push(handler);
    }

    pub fn cache(&self) -> Cache<R> {
        self.cache.clone()
    }

    pub fn gate(&self) -> SyncGate {
        SyncGate { kind: R::KIND, rx: self.synced_rx.clone() }
    }

    pub fn has_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    /// Spawn the reflector and ingest tasks. Returns immediately.
    pub fn start(&self, cancel: CancellationToken) -> Cache<R> {
        let tx = spawn_ingest(
            self.config.channel_cap.max(1),
            self.cache.clone(),
            self.handlers.clone(),
            Arc::clone(&self.synced_tx),
        );
        let reflector = Reflector { api: Arc::clone(&self.api), config: self.config.clone(), tx };
        tokio::spawn(reflector.run(cancel));
        info!(kind = R::KIND, namespace = ?self.config.namespace, handlers = self.handlers.len(), "informer started");
        self.cache()
    }

    pub async fn wait_for_sync(&self, timeout: Duration, cancel: &CancellationToken) -> bool {
        wait_for_cache_sync(timeout, cancel, [self.gate()]).await
    }
}

/// Consume deltas in batches: apply, publish the new snapshot, then notify.
fn spawn_ingest<R: Resource>(
    cap: usize,
    cache: Cache<R>,
    handlers: Vec<Arc<dyn EventHandler<R>>>,
    synced: Arc<watch::Sender<bool>>,
) -> mpsc::Sender<Delta<R>> {
    let (tx, mut rx) = mpsc::channel::<Delta<R>>(cap);
    tokio::spawn(async move {
        let mut builder = SnapshotBuilder::new();
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < cap {
                match rx.try_recv() {
                    Ok(d) => batch.push(d),
                    Err(_) => break,
                }
            }
            let became_synced = batch.iter().any(|d| matches!(d, Delta::Synced));
            let notes = builder.apply(batch);
            if !notes.is_empty() {
                cache.snap.store(builder.freeze());
                gauge!("cache_objects", builder.len() as f64, "kind" => R::KIND);
            }
            for n in &notes {
                counter!("cache_events_total", 1u64, "kind" => R::KIND, "event" => n.label());
                for h in &handlers {
                    h.on_event(n);
                }
            }
            if became_synced {
                synced.send_replace(true);
            }
        }
        debug!(kind = R::KIND, "ingest loop stopped");
    });
    tx
}
