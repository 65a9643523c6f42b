//! Ekko kubehub: the contract the engine needs from the external store,
//! a kube-rs implementation of it and an in-memory one for tests and demos.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{Context, Result};
use futures::stream::BoxStream;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::Client;
use tracing::info;

use ekko_core::{Listing, Resource, ResourceIdentity, WatchEvent};

pub mod crd;
pub mod kube_store;
pub mod memory;

pub use crd::{crds, Echo, EchoResourceSpec, EchoResourceStatus};
pub use kube_store::{KubeApi, KubeDefinitions, KubeStore};
pub use memory::{MemoryApi, MemoryDefinitions, MemoryStore, Op};

/// Errors surfaced by store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The requested watch version is too old; a fresh list is required.
    #[error("resource version expired: {0}")]
    Expired(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists(_)) }
    pub fn is_expired(&self) -> bool { matches!(self, StoreError::Expired(_)) }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => match ae.code {
                404 => StoreError::NotFound(ae.message),
                409 if ae.reason == "AlreadyExists" => StoreError::AlreadyExists(ae.message),
                409 => StoreError::Conflict(ae.message),
                410 => StoreError::Expired(ae.message),
                code => StoreError::Api { code, message: ae.message },
            },
            kube::Error::SerdeError(e) => StoreError::Decode(e.to_string()),
            other => StoreError::Transport(other.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub type WatchStream<R> = BoxStream<'static, StoreResult<WatchEvent<R>>>;

/// Per-kind access to the external store.
///
/// `namespace = None` means all namespaces.
#[async_trait::async_trait]
pub trait ResourceApi<R: Resource>: Send + Sync {
    async fn list(&self, namespace: Option<&str>) -> StoreResult<Listing<R>>;

    /// Stream changes strictly after `from_version`. The stream ends when the
    /// server closes it; callers resume from the last version they saw.
    async fn watch(&self, namespace: Option<&str>, from_version: &str) -> StoreResult<WatchStream<R>>;

    async fn get(&self, id: &ResourceIdentity) -> StoreResult<Option<R>>;

    /// Fails with `AlreadyExists` when the identity is taken.
    async fn create(&self, record: &R) -> StoreResult<R>;

    /// Write only the status of `record`, guarded by its resource version.
    async fn update_status(&self, record: &R) -> StoreResult<R>;
}

/// Schema registration endpoint.
#[async_trait::async_trait]
pub trait DefinitionApi: Send + Sync {
    async fn get(&self, name: &str) -> StoreResult<Option<CustomResourceDefinition>>;
    async fn create(&self, crd: &CustomResourceDefinition) -> StoreResult<CustomResourceDefinition>;
    /// Merge-patch `crd` onto the existing definition `name`.
    async fn patch(&self, name: &str, crd: &CustomResourceDefinition) -> StoreResult<CustomResourceDefinition>;
}

/// Build a kube client from an explicit kubeconfig path, or the default
/// in-cluster / `$KUBECONFIG` resolution when none is given.
pub async fn get_kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = kube::config::Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = kube::Config::from_custom_kubeconfig(kc, &kube::config::KubeConfigOptions::default())
                .await
                .context("building client config from kubeconfig")?;
            info!(path = %path.display(), cluster = %cfg.cluster_url, "using kubeconfig");
            Client::try_from(cfg).context("creating kube client")
        }
        None => Client::try_default().await.context("creating default kube client"),
    }
}
