//! kube-rs backed store: `Echo` and `Pod` through the API server.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, Pod, PodSpec};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference as KubeOwnerReference};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams, WatchEvent as KubeWatchEvent, WatchParams};
use kube::{Client, ResourceExt};
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use ekko_core::{ChildRecord, EchoRecord, Listing, OwnerReference, RecordMeta, Resource, ResourceIdentity, WatchEvent};

use crate::crd::Echo;
use crate::{DefinitionApi, ResourceApi, StoreError, StoreResult, WatchStream};

/// Name of the single container in a child pod.
pub const CHILD_CONTAINER: &str = "echoserver";
/// Environment variable carrying the parent's message into the child.
pub const MESSAGE_ENV: &str = "ECHO_MESSAGE";
pub const CHILD_PORT: i32 = 80;

/// Server-side watch timeout; the stream ends after this and is resumed.
const WATCH_TIMEOUT_SECS: u32 = 290;

pub(crate) fn meta_from(meta: &ObjectMeta, name: &str) -> StoreResult<RecordMeta> {
    if name.is_empty() {
        return Err(StoreError::Decode("object missing metadata.name".into()));
    }
    Ok(RecordMeta {
        identity: ResourceIdentity::new(meta.namespace.clone().unwrap_or_default(), name),
        uid: meta.uid.clone().unwrap_or_default(),
        resource_version: meta.resource_version.clone().unwrap_or_default(),
    })
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() { None } else { Some(s.to_string()) }
}

pub(crate) fn object_meta(meta: &RecordMeta) -> ObjectMeta {
    ObjectMeta {
        name: Some(meta.identity.name.clone()),
        namespace: non_empty(&meta.identity.namespace),
        uid: non_empty(&meta.uid),
        resource_version: non_empty(&meta.resource_version),
        ..Default::default()
    }
}

/// A kube object type that maps onto one of the engine's record types.
pub trait StoreObject:
    kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + DeserializeOwned
    + Serialize
    + fmt::Debug
    + Send
    + Sync
    + 'static
{
    type Record: Resource;

    fn to_record(&self) -> StoreResult<Self::Record>;
    fn from_record(rec: &Self::Record) -> Self;
    /// Body of the `status` field for a status-only write.
    fn status_patch(rec: &Self::Record) -> serde_json::Value;
}

impl StoreObject for Echo {
    type Record = EchoRecord;

    fn to_record(&self) -> StoreResult<EchoRecord> { EchoRecord::try_from(self) }
    fn from_record(rec: &EchoRecord) -> Self { Echo::from(rec) }

    fn status_patch(rec: &EchoRecord) -> serde_json::Value {
        serde_json::json!({ "childName": rec.status.as_ref().map(|s| s.child_name.as_str()).unwrap_or("") })
    }
}

impl StoreObject for Pod {
    type Record = ChildRecord;

    fn to_record(&self) -> StoreResult<ChildRecord> {
        let meta = meta_from(&self.metadata, &self.name_any())?;
        let owner_references = self
            .owner_references()
            .iter()
            .map(|o| OwnerReference {
                api_version: o.api_version.clone(),
                kind: o.kind.clone(),
                name: o.name.clone(),
                uid: o.uid.clone(),
                controller: o.controller.unwrap_or(false),
                block_owner_deletion: o.block_owner_deletion.unwrap_or(false),
            })
            .collect();
        let container = self.spec.as_ref().and_then(|s| s.containers.first());
        let message = container
            .and_then(|c| c.env.as_ref())
            .and_then(|env| env.iter().find(|e| e.name == MESSAGE_ENV))
            .and_then(|e| e.value.clone())
            .unwrap_or_default();
        Ok(ChildRecord {
            meta,
            owner_references,
            phase: self.status.as_ref().and_then(|s| s.phase.clone()),
            labels: self.labels().clone(),
            image: container.and_then(|c| c.image.clone()).unwrap_or_default(),
            message,
        })
    }

    fn from_record(rec: &ChildRecord) -> Self {
        let mut metadata = object_meta(&rec.meta);
        metadata.labels = Some(rec.labels.clone());
        metadata.owner_references = Some(
            rec.owner_references
                .iter()
                .map(|o| KubeOwnerReference {
                    api_version: o.api_version.clone(),
                    kind: o.kind.clone(),
                    name: o.name.clone(),
                    uid: o.uid.clone(),
                    controller: Some(o.controller),
                    block_owner_deletion: Some(o.block_owner_deletion),
                })
                .collect(),
        );
        Pod {
            metadata,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: CHILD_CONTAINER.to_string(),
                    image: non_empty(&rec.image),
                    env: Some(vec![EnvVar {
                        name: MESSAGE_ENV.to_string(),
                        value: Some(rec.message.clone()),
                        ..Default::default()
                    }]),
                    ports: Some(vec![ContainerPort { container_port: CHILD_PORT, ..Default::default() }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        }
    }

    fn status_patch(rec: &ChildRecord) -> serde_json::Value {
        serde_json::json!({ "phase": rec.phase })
    }
}

fn observe<T>(op: &'static str, kind: &'static str, res: StoreResult<T>) -> StoreResult<T> {
    if res.is_err() {
        counter!("store_errors_total", 1u64, "op" => op, "kind" => kind);
    }
    res
}

fn decode<K: StoreObject>(obj: &K) -> Option<K::Record> {
    match obj.to_record() {
        Ok(r) => Some(r),
        Err(e) => {
            warn!(kind = K::Record::KIND, error = %e, "dropping undecodable object");
            None
        }
    }
}

/// [`ResourceApi`] over a namespaced kube type.
pub struct KubeApi<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K: StoreObject> KubeApi<K> {
    pub fn new(client: Client) -> Self {
        Self { client, _kind: PhantomData }
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(ns) if !ns.is_empty() => Api::namespaced(self.client.clone(), ns),
            _ => Api::all(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl<K: StoreObject> ResourceApi<K::Record> for KubeApi<K> {
    async fn list(&self, namespace: Option<&str>) -> StoreResult<Listing<K::Record>> {
        let kind = K::Record::KIND;
        let list = observe("list", kind, self.api(namespace).list(&ListParams::default()).await.map_err(StoreError::from))?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let items = list.items.iter().filter_map(decode::<K>).collect();
        Ok(Listing { resource_version, items })
    }

    async fn watch(&self, namespace: Option<&str>, from_version: &str) -> StoreResult<WatchStream<K::Record>> {
        let kind = K::Record::KIND;
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let stream = observe("watch", kind, self.api(namespace).watch(&wp, from_version).await.map_err(StoreError::from))?;
        let mapped = stream.filter_map(|ev| {
            futures::future::ready(match ev {
                Ok(KubeWatchEvent::Added(o)) => decode(&o).map(|r| Ok(WatchEvent::Added(r))),
                Ok(KubeWatchEvent::Modified(o)) => decode(&o).map(|r| Ok(WatchEvent::Modified(r))),
                Ok(KubeWatchEvent::Deleted(o)) => decode(&o).map(|r| Ok(WatchEvent::Deleted(r))),
                Ok(KubeWatchEvent::Bookmark(b)) => Some(Ok(WatchEvent::Bookmark(b.metadata.resource_version))),
                Ok(KubeWatchEvent::Error(e)) => Some(Err(StoreError::from(kube::Error::Api(e)))),
                Err(e) => Some(Err(StoreError::from(e))),
            })
        });
        Ok(mapped.boxed())
    }

    async fn get(&self, id: &ResourceIdentity) -> StoreResult<Option<K::Record>> {
        let kind = K::Record::KIND;
        let found = observe("get", kind, self.api(Some(&id.namespace)).get_opt(&id.name).await.map_err(StoreError::from))?;
        found.as_ref().map(K::to_record).transpose()
    }

    async fn create(&self, record: &K::Record) -> StoreResult<K::Record> {
        let kind = K::Record::KIND;
        let obj = K::from_record(record);
        let api = self.api(Some(&record.identity().namespace));
        let created = observe("create", kind, api.create(&PostParams::default(), &obj).await.map_err(StoreError::from))?;
        created.to_record()
    }

    async fn update_status(&self, record: &K::Record) -> StoreResult<K::Record> {
        let kind = K::Record::KIND;
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": record.resource_version() },
            "status": K::status_patch(record),
        });
        let api = self.api(Some(&record.identity().namespace));
        let updated = observe(
            "update_status",
            kind,
            api.patch_status(&record.identity().name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(StoreError::from),
        )?;
        updated.to_record()
    }
}

/// [`DefinitionApi`] over `apiextensions.k8s.io/v1`.
pub struct KubeDefinitions {
    api: Api<CustomResourceDefinition>,
}

impl KubeDefinitions {
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait::async_trait]
impl DefinitionApi for KubeDefinitions {
    async fn get(&self, name: &str) -> StoreResult<Option<CustomResourceDefinition>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, crd: &CustomResourceDefinition) -> StoreResult<CustomResourceDefinition> {
        Ok(self.api.create(&PostParams::default(), crd).await?)
    }

    async fn patch(&self, name: &str, crd: &CustomResourceDefinition) -> StoreResult<CustomResourceDefinition> {
        Ok(self.api.patch(name, &PatchParams::default(), &Patch::Merge(crd)).await?)
    }
}

/// Entry point bundling the per-kind APIs over one client.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn echoes(&self) -> Arc<dyn ResourceApi<EchoRecord>> {
        Arc::new(KubeApi::<Echo>::new(self.client.clone()))
    }

    pub fn children(&self) -> Arc<dyn ResourceApi<ChildRecord>> {
        Arc::new(KubeApi::<Pod>::new(self.client.clone()))
    }

    pub fn definitions(&self) -> Arc<dyn DefinitionApi> {
        Arc::new(KubeDefinitions::new(self.client.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ekko_core::KindRegistry;

    #[test]
    fn pod_conversion_carries_owner_and_message() {
        let registry = KindRegistry::standard();
        let mut owner = RecordMeta::new(ResourceIdentity::new("default", "demo"));
        owner.uid = "u-demo".into();
        let mut child = ChildRecord::new(ResourceIdentity::new("default", "demo-pod"));
        child.owner_references.push(OwnerReference::controller_of(registry.parent(), &owner));
        child.labels.insert("app".into(), "echoserver".into());
        child.image = "reshnm/echoserver:latest".into();
        child.message = "hi".into();

        let pod = Pod::from_record(&child);
        assert_eq!(pod.metadata.resource_version, None);
        let c = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(c.name, CHILD_CONTAINER);
        assert_eq!(c.ports.as_ref().unwrap()[0].container_port, CHILD_PORT);

        let back = pod.to_record().unwrap();
        assert_eq!(back, child);
        assert!(back.is_controlled_by(&owner));
    }

    #[test]
    fn pod_without_name_fails_to_decode() {
        let pod = Pod::default();
        assert!(matches!(pod.to_record(), Err(StoreError::Decode(_))));
    }
}
