//! Turning cache notifications into work keys.

use ekko_core::{ChildRecord, EchoRecord, KindInfo, Notification, Resource, ResourceIdentity};
use ekko_queue::WorkQueue;
use ekko_store::{Cache, EventHandler};
use metrics::counter;
use tracing::{debug, info};

/// Enqueues the parent's own key on every change to it.
pub struct EnqueueParent {
    queue: WorkQueue<String>,
}

impl EnqueueParent {
    pub fn new(queue: WorkQueue<String>) -> Self {
        Self { queue }
    }
}

impl EventHandler<EchoRecord> for EnqueueParent {
    fn on_event(&self, n: &Notification<EchoRecord>) {
        let key = n.object().key();
        debug!(key = %key, event = n.label(), "enqueue parent");
        self.queue.add(key);
    }
}

/// Maps child notifications to the key of the parent controlling the child.
///
/// Every variant is handled the same way using the state it carries, so a
/// deleted child still wakes its parent.
pub struct OwnershipRouter {
    parent_kind: KindInfo,
    parents: Cache<EchoRecord>,
    queue: WorkQueue<String>,
}

impl OwnershipRouter {
    pub fn new(parent_kind: KindInfo, parents: Cache<EchoRecord>, queue: WorkQueue<String>) -> Self {
        Self { parent_kind, parents, queue }
    }

    /// Parent key for `child`, if it is controlled by a parent we know.
    pub fn route(&self, child: &ChildRecord) -> Option<String> {
        let owner = child.controller_ref()?;
        if owner.kind != self.parent_kind.kind {
            return None;
        }
        let parent_id = ResourceIdentity::new(child.meta.identity.namespace.clone(), owner.name.clone());
        match self.parents.get(&parent_id) {
            Some(parent) => Some(parent.key()),
            None => {
                info!(child = %child.meta.identity, owner = %owner.name, "ignoring orphaned child");
                None
            }
        }
    }
}

impl EventHandler<ChildRecord> for OwnershipRouter {
    fn on_event(&self, n: &Notification<ChildRecord>) {
        let child = n.object();
        match self.route(child) {
            Some(key) => {
                debug!(child = %child.meta.identity, key = %key, event = n.label(), "child routed to parent");
                counter!("router_routed_total", 1u64, "result" => "enqueued");
                self.queue.add(key);
            }
            None => counter!("router_routed_total", 1u64, "result" => "ignored"),
        }
    }
}
