//! Ekko schema: make sure our CustomResourceDefinitions exist, match what we
//! ship, and are being served before anything watches them.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use ekko_kubehub::{DefinitionApi, StoreError};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum CrdError {
    #[error("definition has no metadata.name")]
    MissingName,
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("definitions not established after {after:?}: {pending:?}")]
    Timeout { after: Duration, pending: Vec<String> },
    #[error("cancelled while waiting for definitions")]
    Cancelled,
}

/// True when the server reports both `Established` and `NamesAccepted`.
pub fn is_established(crd: &CustomResourceDefinition) -> bool {
    let conds = crd.status.as_ref().and_then(|s| s.conditions.as_deref()).unwrap_or(&[]);
    let is_true = |t: &str| conds.iter().any(|c| c.type_ == t && c.status == "True");
    is_true("Established") && is_true("NamesAccepted")
}

/// Installs definitions and waits for them.
pub struct CrdManager {
    api: Arc<dyn DefinitionApi>,
    poll_interval: Duration,
    deadline: Duration,
}

impl CrdManager {
    pub fn new(api: Arc<dyn DefinitionApi>) -> Self {
        Self { api, poll_interval: DEFAULT_POLL_INTERVAL, deadline: DEFAULT_DEADLINE }
    }

    pub fn with_timing(mut self, poll_interval: Duration, deadline: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.deadline = deadline;
        self
    }

    /// Create or update every definition, then wait until all are established.
    pub async fn ensure_definitions(
        &self,
        defs: &[CustomResourceDefinition],
        cancel: &CancellationToken,
    ) -> Result<(), CrdError> {
        let mut names = Vec::with_capacity(defs.len());
        for crd in defs {
            names.push(self.apply(crd).await?);
        }
        self.wait_established(&names, cancel).await
    }

    async fn apply(&self, desired: &CustomResourceDefinition) -> Result<String, CrdError> {
        let name = desired.metadata.name.clone().ok_or(CrdError::MissingName)?;
        match self.api.get(&name).await? {
            None => match self.api.create(desired).await {
                Ok(_) => {
                    info!(crd = %name, "definition created");
                    return Ok(name);
                }
                Err(e) if e.is_already_exists() => {
                    debug!(crd = %name, "definition appeared concurrently; updating instead");
                    let existing = self.api.get(&name).await?.ok_or_else(|| StoreError::NotFound(name.clone()))?;
                    self.update(&name, desired, &existing).await?;
                }
                Err(e) => return Err(e.into()),
            },
            Some(existing) => self.update(&name, desired, &existing).await?,
        }
        Ok(name)
    }

    async fn update(
        &self,
        name: &str,
        desired: &CustomResourceDefinition,
        existing: &CustomResourceDefinition,
    ) -> Result<(), CrdError> {
        let mut patch = desired.clone();
        patch.metadata.resource_version = existing.metadata.resource_version.clone();
        patch.metadata.uid = existing.metadata.uid.clone();
        self.api.patch(name, &patch).await?;
        info!(crd = %name, "definition updated");
        Ok(())
    }

    /// Poll until every named definition is established.
    pub async fn wait_established(&self, names: &[String], cancel: &CancellationToken) -> Result<(), CrdError> {
        let started = Instant::now();
        let mut pending: Vec<String> = names.to_vec();
        loop {
            let mut still = Vec::new();
            for name in pending {
                match self.api.get(&name).await {
                    Ok(Some(crd)) if is_established(&crd) => debug!(crd = %name, "definition established"),
                    Ok(_) => still.push(name),
                    Err(e) => {
                        warn!(crd = %name, error = %e, "poll error; retrying");
                        still.push(name);
                    }
                }
            }
            pending = still;
            if pending.is_empty() {
                info!(count = names.len(), elapsed_ms = started.elapsed().as_millis() as u64, "definitions established");
                return Ok(());
            }
            if started.elapsed() >= self.deadline {
                return Err(CrdError::Timeout { after: self.deadline, pending });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(CrdError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PrinterCol {
    pub name: String,
    pub json_path: String,
}

/// Short description of a definition for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrdSummary {
    pub name: String,
    pub group: String,
    pub kind: String,
    pub scope: String,
    pub served_version: String,
    pub printer_cols: Vec<PrinterCol>,
}

pub fn summarize(crd: &CustomResourceDefinition) -> CrdSummary {
    let served = crd.spec.versions.iter().find(|v| v.storage).or_else(|| crd.spec.versions.iter().find(|v| v.served));
    CrdSummary {
        name: crd.metadata.name.clone().unwrap_or_default(),
        group: crd.spec.group.clone(),
        kind: crd.spec.names.kind.clone(),
        scope: crd.spec.scope.clone(),
        served_version: served.map(|v| v.name.clone()).unwrap_or_default(),
        printer_cols: served
            .and_then(|v| v.additional_printer_columns.as_ref())
            .map(|cols| {
                cols.iter().map(|c| PrinterCol { name: c.name.clone(), json_path: c.json_path.clone() }).collect()
            })
            .unwrap_or_default(),
    }
}
