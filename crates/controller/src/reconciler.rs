use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ekko_core::{
    ChildRecord, EchoRecord, EchoStatus, KeyError, KindInfo, KindRegistry, OwnerReference, Resource,
    ResourceIdentity,
};
use ekko_kubehub::{ResourceApi, StoreError};
use ekko_store::Cache;
use metrics::counter;
use smallvec::smallvec;
use tracing::{debug, info};

use crate::config::ControllerConfig;

pub const CHILD_SUFFIX: &str = "-pod";
pub const APP_LABEL: &str = "echoserver";

/// What the worker should do with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("malformed key: {0}")]
    MalformedKey(#[from] KeyError),
    #[error("{child} exists but is not controlled by {parent}")]
    NotControlled { parent: String, child: String },
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// Malformed keys will never parse, so retrying them is pointless.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileError::MalformedKey(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReconcileError::MalformedKey(_) => "malformed_key",
            ReconcileError::NotControlled { .. } => "not_controlled",
            ReconcileError::Store(_) => "store",
        }
    }
}

#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &str) -> Result<Action, ReconcileError>;
}

pub fn child_name(parent: &ResourceIdentity) -> String {
    format!("{}{}", parent.name, CHILD_SUFFIX)
}

/// Desired child for `parent`: labelled, running `image`, controlled by the parent.
pub fn build_child(parent: &EchoRecord, parent_kind: &KindInfo, image: &str) -> ChildRecord {
    let id = parent.identity();
    let mut child = ChildRecord::new(ResourceIdentity::new(id.namespace.clone(), child_name(id)));
    child.labels = BTreeMap::from([
        ("app".to_string(), APP_LABEL.to_string()),
        ("controller".to_string(), id.name.clone()),
    ]);
    child.image = image.to_string();
    child.message = parent.spec.message.clone();
    child.owner_references = smallvec![OwnerReference::controller_of(parent_kind, &parent.meta)];
    child
}

/// Converges one echo: its child exists, is ours, and is named in status.
pub struct Reconciler {
    registry: KindRegistry,
    parents: Cache<EchoRecord>,
    echoes: Arc<dyn ResourceApi<EchoRecord>>,
    children: Arc<dyn ResourceApi<ChildRecord>>,
    child_image: String,
    requeue: Duration,
}

impl Reconciler {
    pub fn new(
        registry: KindRegistry,
        parents: Cache<EchoRecord>,
        echoes: Arc<dyn ResourceApi<EchoRecord>>,
        children: Arc<dyn ResourceApi<ChildRecord>>,
        config: &ControllerConfig,
    ) -> Self {
        Self { registry, parents, echoes, children, child_image: config.child_image.clone(), requeue: config.requeue }
    }

    async fn ensure_child(&self, parent: &EchoRecord) -> Result<ChildRecord, ReconcileError> {
        let desired = build_child(parent, self.registry.parent(), &self.child_image);
        let child_id = desired.identity().clone();
        if let Some(existing) = self.children.get(&child_id).await? {
            return Ok(existing);
        }
        info!(child = %child_id, "creating child");
        match self.children.create(&desired).await {
            Ok(created) => {
                counter!("children_created_total", 1u64);
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(child = %child_id, "child created concurrently; re-reading");
                let existing = self.children.get(&child_id).await?;
                existing.ok_or_else(|| StoreError::NotFound(child_id.key()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write `status.childName` unless the parent already names the child.
    async fn record_child(&self, parent: &EchoRecord, child: &ChildRecord) -> Result<(), ReconcileError> {
        let name = child.identity().name.as_str();
        if parent.child_name() == Some(name) {
            return Ok(());
        }
        // The cache may lag our own earlier write.
        let Some(mut fresh) = self.echoes.get(parent.identity()).await? else {
            debug!(key = %parent.identity(), "parent gone before status update");
            return Ok(());
        };
        if fresh.child_name() == Some(name) {
            return Ok(());
        }
        fresh.status = Some(EchoStatus { child_name: name.to_string() });
        self.echoes.update_status(&fresh).await?;
        info!(key = %parent.identity(), child = %name, "status updated");
        Ok(())
    }
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, key: &str) -> Result<Action, ReconcileError> {
        let id: ResourceIdentity = key.parse()?;
        let Some(parent) = self.parents.get(&id) else {
            info!(key = %key, "echo no longer exists");
            return Ok(Action::Done);
        };
        debug!(key = %key, message = %parent.spec.message, "reconciling echo");

        let child = self.ensure_child(&parent).await?;
        if !child.is_controlled_by(&parent.meta) {
            return Err(ReconcileError::NotControlled { parent: parent.key(), child: child.key() });
        }
        self.record_child(&parent, &child).await?;

        if self.requeue.is_zero() {
            Ok(Action::Done)
        } else {
            Ok(Action::RequeueAfter(self.requeue))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_child_matches_parent() {
        let registry = KindRegistry::standard();
        let mut parent = EchoRecord::new(ResourceIdentity::new("default", "demo"), "hi");
        parent.meta.uid = "u-demo".into();
        let child = build_child(&parent, registry.parent(), "img:1");

        assert_eq!(child.meta.identity, ResourceIdentity::new("default", "demo-pod"));
        assert_eq!(child.labels.get("app").map(String::as_str), Some("echoserver"));
        assert_eq!(child.labels.get("controller").map(String::as_str), Some("demo"));
        assert_eq!(child.message, "hi");
        assert_eq!(child.image, "img:1");
        assert!(child.is_controlled_by(&parent.meta));
        let owner = child.controller_ref().unwrap();
        assert_eq!(owner.kind, "Echo");
        assert!(owner.block_owner_deletion);
    }

    #[test]
    fn only_malformed_keys_are_final() {
        assert!(!ReconcileError::MalformedKey(KeyError::Empty).is_retryable());
        assert!(ReconcileError::Store(StoreError::Conflict("x".into())).is_retryable());
        assert!(ReconcileError::NotControlled { parent: "a".into(), child: "b".into() }.is_retryable());
    }
}
