//! Applies reflector deltas to the working map and decides what handlers hear.

use std::sync::Arc;

use ekko_core::{Notification, Resource, ResourceIdentity, WatchEvent};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

pub type Snapshot<R> = FxHashMap<ResourceIdentity, Arc<R>>;

/// What the reflector hands to the ingest loop.
#[derive(Debug)]
pub(crate) enum Delta<R> {
    Event(WatchEvent<R>),
    /// Full state from a list; anything cached but absent was deleted unseen.
    Replace(Vec<R>),
    /// Initial list applied and watch open.
    Synced,
}

/// Working copy of one kind's cache.
pub(crate) struct SnapshotBuilder<R> {
    items: Snapshot<R>,
}

impl<R: Resource> SnapshotBuilder<R> {
    pub(crate) fn new() -> Self {
        Self { items: FxHashMap::default() }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Apply a batch in order, returning the notifications it produced.
    pub(crate) fn apply(&mut self, batch: Vec<Delta<R>>) -> Vec<Notification<R>> {
        let mut out = Vec::new();
        for d in batch {
            match d {
                Delta::Event(WatchEvent::Added(r)) | Delta::Event(WatchEvent::Modified(r)) => {
                    if let Some(n) = self.upsert(r) {
                        out.push(n);
                    }
                }
                Delta::Event(WatchEvent::Deleted(r)) => {
                    // The tombstone is at least as new as what we held.
                    self.items.remove(r.identity());
                    out.push(Notification::Deleted(Arc::new(r)));
                }
                Delta::Event(WatchEvent::Bookmark(_)) | Delta::Synced => {}
                Delta::Replace(items) => self.replace(items, &mut out),
            }
        }
        out
    }

    fn upsert(&mut self, r: R) -> Option<Notification<R>> {
        let id = r.identity().clone();
        match self.items.get(&id) {
            Some(old) if old.resource_version() == r.resource_version() => {
                trace!(key = %id, rv = r.resource_version(), "unchanged version; dropped");
                None
            }
            Some(old) => {
                let old = Arc::clone(old);
                let new = Arc::new(r);
                self.items.insert(id, Arc::clone(&new));
                Some(Notification::Modified { old, new })
            }
            None => {
                let new = Arc::new(r);
                self.items.insert(id, Arc::clone(&new));
                Some(Notification::Added(new))
            }
        }
    }

    fn replace(&mut self, items: Vec<R>, out: &mut Vec<Notification<R>>) {
        let mut seen: FxHashSet<ResourceIdentity> = FxHashSet::default();
        for r in items {
            seen.insert(r.identity().clone());
            if let Some(n) = self.upsert(r) {
                out.push(n);
            }
        }
        let gone: Vec<ResourceIdentity> = self.items.keys().filter(|id| !seen.contains(*id)).cloned().collect();
        for id in gone {
            if let Some(last) = self.items.remove(&id) {
                out.push(Notification::DeletedFinalStateUnknown(last));
            }
        }
    }

    pub(crate) fn freeze(&self) -> Arc<Snapshot<R>> {
        Arc::new(self.items.clone())
    }
}
