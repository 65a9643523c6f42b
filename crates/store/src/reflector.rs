//! List-then-watch loop feeding the ingest task.

use std::sync::Arc;
use std::time::Duration;

use ekko_core::{Resource, WatchEvent};
use ekko_kubehub::{ResourceApi, StoreError};
use futures::StreamExt;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ingest::Delta;
use crate::InformerConfig;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Pause before reopening a watch that ended without delivering anything.
const IDLE_RESUME_DELAY: Duration = Duration::from_millis(200);

/// How a watch session ended.
enum Next {
    /// Reopen the watch from the last seen version. `idle` when the stream
    /// delivered nothing, bookmarks included.
    Resume { idle: bool },
    /// Start over with a full list.
    Relist,
    /// Back off, then relist.
    Backoff(StoreError),
    Stop,
}

pub(crate) struct Reflector<R: Resource> {
    pub(crate) api: Arc<dyn ResourceApi<R>>,
    pub(crate) config: InformerConfig,
    pub(crate) tx: mpsc::Sender<Delta<R>>,
}

impl<R: Resource> Reflector<R> {
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let ns = self.config.namespace.clone();
        let initial_backoff = INITIAL_BACKOFF.min(self.config.watch_backoff_max);
        let mut backoff = initial_backoff;
        let mut synced = false;

        'list: loop {
            let listing = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.api.list(ns.as_deref()) => r,
            };
            let listing = match listing {
                Ok(l) => l,
                Err(e) => {
                    warn!(kind = R::KIND, error = %e, backoff_ms = backoff.as_millis() as u64, "list failed");
                    if !pause(&cancel, backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(self.config.watch_backoff_max);
                    continue;
                }
            };
            counter!("cache_relists_total", 1u64, "kind" => R::KIND);
            debug!(kind = R::KIND, items = listing.items.len(), rv = %listing.resource_version, "listed");
            let mut version = listing.resource_version;
            if self.tx.send(Delta::Replace(listing.items)).await.is_err() {
                break;
            }
            let resync_at = (!self.config.resync.is_zero()).then(|| Instant::now() + self.config.resync);

            loop {
                let stream = tokio::select! {
                    _ = cancel.cancelled() => break 'list,
                    r = self.api.watch(ns.as_deref(), &version) => r,
                };
                let next = match stream {
                    Ok(mut stream) => {
                        backoff = initial_backoff;
                        if !synced {
                            if self.tx.send(Delta::Synced).await.is_err() {
                                break 'list;
                            }
                            synced = true;
                            info!(kind = R::KIND, "cache synced");
                        }
                        self.pump(&mut stream, &mut version, resync_at, &cancel).await
                    }
                    Err(e) if e.is_expired() => Next::Relist,
                    Err(e) => Next::Backoff(e),
                };
                match next {
                    Next::Resume { idle } => {
                        debug!(kind = R::KIND, rv = %version, idle, "watch closed; resuming");
                        if idle && !pause(&cancel, IDLE_RESUME_DELAY).await {
                            break 'list;
                        }
                        continue;
                    }
                    Next::Relist => {
                        info!(kind = R::KIND, rv = %version, "relisting");
                        continue 'list;
                    }
                    Next::Backoff(e) => {
                        warn!(kind = R::KIND, error = %e, backoff_ms = backoff.as_millis() as u64, "watch failed");
                        if !pause(&cancel, backoff).await {
                            break 'list;
                        }
                        backoff = (backoff * 2).min(self.config.watch_backoff_max);
                        continue 'list;
                    }
                    Next::Stop => break 'list,
                }
            }
        }
        debug!(kind = R::KIND, "reflector stopped");
    }

    async fn pump(
        &self,
        stream: &mut ekko_kubehub::WatchStream<R>,
        version: &mut String,
        resync_at: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Next {
        let mut idle = true;
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Next::Stop,
                _ = tokio::time::sleep_until(resync_at.unwrap_or_else(Instant::now)), if resync_at.is_some() => {
                    debug!(kind = R::KIND, "resync period elapsed");
                    return Next::Relist;
                }
                item = stream.next() => item,
            };
            let ev = match item {
                None => return Next::Resume { idle },
                Some(Err(e)) if e.is_expired() => return Next::Relist,
                Some(Err(e)) => return Next::Backoff(e),
                Some(Ok(ev)) => ev,
            };
            idle = false;
            match &ev {
                WatchEvent::Bookmark(rv) => {
                    *version = rv.clone();
                    continue;
                }
                WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => {
                    if !r.resource_version().is_empty() {
                        *version = r.resource_version().to_string();
                    }
                }
            }
            if self.tx.send(Delta::Event(ev)).await.is_err() {
                return Next::Stop;
            }
        }
    }
}

/// Sleep for `d` unless cancelled first. Returns false on cancellation.
async fn pause(cancel: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}
