//! Ekko core types: identities, records and change notifications.

#![forbid(unsafe_code)]

pub mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub use registry::{KindInfo, KindRegistry};

/// Namespaced name of a resource. Unique per kind.
///
/// The work key form is `namespace/name`; cluster-scoped identities (empty
/// namespace) render as the bare name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("empty work key")]
    Empty,
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
}

impl FromStr for ResourceIdentity {
    type Err = KeyError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        if key.is_empty() {
            return Err(KeyError::Empty);
        }
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new("", *name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::new(*ns, *name)),
            _ => Err(KeyError::Malformed(key.to_string())),
        }
    }
}

/// Store-assigned metadata shared by every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    pub identity: ResourceIdentity,
    #[serde(default)]
    pub uid: String,
    /// Opaque version token; compared only for equality.
    #[serde(default)]
    pub resource_version: String,
}

impl RecordMeta {
    pub fn new(identity: ResourceIdentity) -> Self {
        Self { identity, uid: String::new(), resource_version: String::new() }
    }
}

/// A record kind the engine caches and watches.
pub trait Resource: Clone + fmt::Debug + Send + Sync + 'static {
    /// Kind name as it appears in owner references.
    const KIND: &'static str;

    fn meta(&self) -> &RecordMeta;
    fn meta_mut(&mut self) -> &mut RecordMeta;

    /// Copy the status portion of `other` onto `self`, leaving spec and metadata untouched.
    fn take_status_from(&mut self, other: &Self);

    fn identity(&self) -> &ResourceIdentity {
        &self.meta().identity
    }

    fn resource_version(&self) -> &str {
        &self.meta().resource_version
    }

    fn key(&self) -> String {
        self.identity().key()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoSpec {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EchoStatus {
    pub child_name: String,
}

/// Desired state: the custom resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRecord {
    pub meta: RecordMeta,
    pub spec: EchoSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EchoStatus>,
}

impl EchoRecord {
    pub fn new(identity: ResourceIdentity, message: impl Into<String>) -> Self {
        Self {
            meta: RecordMeta::new(identity),
            spec: EchoSpec { message: message.into() },
            status: None,
        }
    }

    pub fn child_name(&self) -> Option<&str> {
        self.status.as_ref().map(|s| s.child_name.as_str()).filter(|n| !n.is_empty())
    }
}

impl Resource for EchoRecord {
    const KIND: &'static str = "Echo";

    fn meta(&self) -> &RecordMeta { &self.meta }
    fn meta_mut(&mut self) -> &mut RecordMeta { &mut self.meta }

    fn take_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

/// Back-reference from a child to the object controlling it. Lookup only;
/// lifetime is decided by the store's garbage collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
    #[serde(default)]
    pub block_owner_deletion: bool,
}

impl OwnerReference {
    /// Controller reference pointing at `owner` of kind `info`.
    pub fn controller_of(info: &KindInfo, owner: &RecordMeta) -> Self {
        Self {
            api_version: info.api_version(),
            kind: info.kind.to_string(),
            name: owner.identity.name.clone(),
            uid: owner.uid.clone(),
            controller: true,
            block_owner_deletion: true,
        }
    }
}

/// Actual state: the dependent child resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildRecord {
    pub meta: RecordMeta,
    #[serde(default)]
    pub owner_references: SmallVec<[OwnerReference; 1]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub image: String,
    /// Message served by the child, taken from the parent's spec at creation.
    #[serde(default)]
    pub message: String,
}

impl ChildRecord {
    pub fn new(identity: ResourceIdentity) -> Self {
        Self {
            meta: RecordMeta::new(identity),
            owner_references: SmallVec::new(),
            phase: None,
            labels: BTreeMap::new(),
            image: String::new(),
            message: String::new(),
        }
    }

    /// The owner reference marked `controller: true`, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|o| o.controller)
    }

    pub fn is_controlled_by(&self, owner: &RecordMeta) -> bool {
        self.controller_ref().map(|o| o.uid == owner.uid).unwrap_or(false)
    }
}

impl Resource for ChildRecord {
    const KIND: &'static str = "Pod";

    fn meta(&self) -> &RecordMeta { &self.meta }
    fn meta_mut(&mut self) -> &mut RecordMeta { &mut self.meta }

    fn take_status_from(&mut self, other: &Self) {
        self.phase = other.phase.clone();
    }
}

/// Raw event produced by a store watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<R> {
    Added(R),
    Modified(R),
    Deleted(R),
    /// Progress marker carrying only a resume version.
    Bookmark(String),
}

/// Result of a full list: the items plus the version to resume watching from.
#[derive(Debug, Clone)]
pub struct Listing<R> {
    pub resource_version: String,
    pub items: Vec<R>,
}

/// Change notification delivered to cache handlers after the cache applied it.
#[derive(Debug, Clone)]
pub enum Notification<R> {
    Added(Arc<R>),
    Modified { old: Arc<R>, new: Arc<R> },
    Deleted(Arc<R>),
    /// Delete detected by relist diffing; carries the last state the cache held.
    DeletedFinalStateUnknown(Arc<R>),
}

impl<R> Notification<R> {
    /// Latest known state of the object the notification is about.
    pub fn object(&self) -> &Arc<R> {
        match self {
            Notification::Added(o)
            | Notification::Deleted(o)
            | Notification::DeletedFinalStateUnknown(o) => o,
            Notification::Modified { new, .. } => new,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Notification::Added(_) => "added",
            Notification::Modified { .. } => "modified",
            Notification::Deleted(_) => "deleted",
            Notification::DeletedFinalStateUnknown(_) => "deleted_unknown",
        }
    }
}

pub mod prelude {
    pub use super::{
        ChildRecord, EchoRecord, EchoSpec, EchoStatus, KindInfo, KindRegistry, Listing, Notification,
        OwnerReference, RecordMeta, Resource, ResourceIdentity, WatchEvent,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrips_namespaced_and_cluster_scoped() {
        let id: ResourceIdentity = "default/demo".parse().unwrap();
        assert_eq!(id, ResourceIdentity::new("default", "demo"));
        assert_eq!(id.key(), "default/demo");

        let cluster: ResourceIdentity = "demo".parse().unwrap();
        assert_eq!(cluster.namespace, "");
        assert_eq!(cluster.key(), "demo");
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert_eq!("".parse::<ResourceIdentity>(), Err(KeyError::Empty));
        for bad in ["a/b/c", "/demo", "default/", "/"] {
            assert!(matches!(bad.parse::<ResourceIdentity>(), Err(KeyError::Malformed(_))), "{bad}");
        }
    }

    #[test]
    fn controller_ref_ignores_non_controller_owners() {
        let mut child = ChildRecord::new(ResourceIdentity::new("default", "demo-pod"));
        child.owner_references.push(OwnerReference {
            api_version: "apps/v1".into(),
            kind: "ReplicaSet".into(),
            name: "rs".into(),
            uid: "u-rs".into(),
            controller: false,
            block_owner_deletion: false,
        });
        assert!(child.controller_ref().is_none());

        let registry = KindRegistry::standard();
        let mut owner = RecordMeta::new(ResourceIdentity::new("default", "demo"));
        owner.uid = "u-demo".into();
        child.owner_references.push(OwnerReference::controller_of(registry.parent(), &owner));
        let ctl = child.controller_ref().unwrap();
        assert_eq!(ctl.kind, "Echo");
        assert_eq!(ctl.api_version, "ekko.dev/v1alpha1");
        assert!(child.is_controlled_by(&owner));
    }

    #[test]
    fn notification_object_is_latest_state() {
        let a = Arc::new(EchoRecord::new(ResourceIdentity::new("ns", "a"), "one"));
        let b = Arc::new(EchoRecord::new(ResourceIdentity::new("ns", "a"), "two"));
        let n = Notification::Modified { old: a, new: b };
        assert_eq!(n.object().spec.message, "two");
        assert_eq!(n.label(), "modified");
    }
}
