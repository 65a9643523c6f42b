//! The `Echo` custom resource as served by the API server.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{CustomResource, CustomResourceExt, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ekko_core::{EchoRecord, EchoSpec, EchoStatus};

use crate::kube_store::{meta_from, object_meta};
use crate::{StoreError, StoreResult};

/// Desired state of an echo server: the message its pod should answer with.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ekko.dev",
    version = "v1alpha1",
    kind = "Echo",
    plural = "echoes",
    shortname = "ec",
    status = "EchoResourceStatus",
    namespaced,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".spec.message"}"#,
    printcolumn = r#"{"name":"Pod","type":"string","jsonPath":".status.childName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct EchoResourceSpec {
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EchoResourceStatus {
    #[serde(default)]
    pub child_name: String,
}

/// Definitions the engine installs before it starts watching.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![Echo::crd()]
}

impl TryFrom<&Echo> for EchoRecord {
    type Error = StoreError;

    fn try_from(obj: &Echo) -> StoreResult<Self> {
        Ok(EchoRecord {
            meta: meta_from(&obj.metadata, &obj.name_any())?,
            spec: EchoSpec { message: obj.spec.message.clone() },
            status: obj.status.as_ref().map(|s| EchoStatus { child_name: s.child_name.clone() }),
        })
    }
}

impl From<&EchoRecord> for Echo {
    fn from(rec: &EchoRecord) -> Self {
        let mut obj = Echo::new(&rec.meta.identity.name, EchoResourceSpec { message: rec.spec.message.clone() });
        obj.metadata = object_meta(&rec.meta);
        obj.status = rec.status.as_ref().map(|s| EchoResourceStatus { child_name: s.child_name.clone() });
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ekko_core::ResourceIdentity;

    #[test]
    fn crd_carries_names_and_status_subresource() {
        let crd = Echo::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("echoes.ekko.dev"));
        assert_eq!(crd.spec.names.kind, "Echo");
        assert_eq!(crd.spec.scope, "Namespaced");
        let v = &crd.spec.versions[0];
        assert_eq!(v.name, "v1alpha1");
        assert!(v.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
    }

    #[test]
    fn record_conversion_keeps_status() {
        let mut rec = EchoRecord::new(ResourceIdentity::new("default", "demo"), "hi");
        rec.meta.uid = "u-1".into();
        rec.meta.resource_version = "7".into();
        rec.status = Some(EchoStatus { child_name: "demo-pod".into() });
        let obj = Echo::from(&rec);
        assert_eq!(obj.metadata.namespace.as_deref(), Some("default"));
        let back = EchoRecord::try_from(&obj).unwrap();
        assert_eq!(back, rec);
    }
}
