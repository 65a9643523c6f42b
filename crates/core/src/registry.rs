//! Explicit registry of the kinds the engine knows about.
//!
//! Built once at startup and handed to the components that need kind lookups.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ChildRecord, EchoRecord, Resource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindInfo {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl KindInfo {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            namespaced,
        }
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// `v1/Kind` or `group/v1/Kind`.
    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }

    /// Name of the CustomResourceDefinition serving this kind (`plural.group`).
    pub fn crd_name(&self) -> Option<String> {
        if self.group.is_empty() { None } else { Some(format!("{}.{}", self.plural, self.group)) }
    }
}

/// The parent kind and the child kind it controls.
#[derive(Debug, Clone)]
pub struct KindRegistry {
    parent: KindInfo,
    child: KindInfo,
}

impl KindRegistry {
    pub fn new(parent: KindInfo, child: KindInfo) -> Self {
        Self { parent, child }
    }

    /// `ekko.dev/v1alpha1/Echo` controlling `v1/Pod`.
    pub fn standard() -> Self {
        Self::new(
            KindInfo::new("ekko.dev", "v1alpha1", EchoRecord::KIND, "echoes", true),
            KindInfo::new("", "v1", ChildRecord::KIND, "pods", true),
        )
    }

    pub fn parent(&self) -> &KindInfo { &self.parent }
    pub fn child(&self) -> &KindInfo { &self.child }
}

impl Default for KindRegistry {
    fn default() -> Self { Self::standard() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_names() {
        let reg = KindRegistry::standard();
        assert_eq!(reg.parent().gvk_key(), "ekko.dev/v1alpha1/Echo");
        assert_eq!(reg.child().gvk_key(), "v1/Pod");
        assert_eq!(reg.parent().crd_name().as_deref(), Some("echoes.ekko.dev"));
        assert_eq!(reg.child().crd_name(), None);
        assert_eq!(reg.parent().api_version(), "ekko.dev/v1alpha1");
        assert_eq!(reg.child().api_version(), "v1");
    }
}
