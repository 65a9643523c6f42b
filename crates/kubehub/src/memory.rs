//! In-memory store used by tests and local demos.
//!
//! Versions are a single counter per kind. A bounded history of events backs
//! watch resumption; asking for a version older than the history yields
//! `Expired`, like a compacted etcd.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionCondition, CustomResourceDefinitionStatus,
};
use tokio::sync::broadcast;
use uuid::Uuid;

use ekko_core::{ChildRecord, EchoRecord, Listing, Resource, ResourceIdentity, WatchEvent};

use crate::{DefinitionApi, ResourceApi, StoreError, StoreResult, WatchStream};

const HISTORY_CAP: usize = 1024;

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    List,
    Watch,
    Get,
    Create,
    UpdateStatus,
}

type Versioned<R> = (u64, WatchEvent<R>);

struct State<R> {
    items: BTreeMap<ResourceIdentity, R>,
    version: u64,
    history: VecDeque<Versioned<R>>,
    /// Lowest version a watch may resume from.
    floor: u64,
    events: broadcast::Sender<Versioned<R>>,
    failures: BTreeMap<Op, u32>,
    calls: BTreeMap<Op, u64>,
}

/// One kind's worth of records.
pub struct MemoryApi<R: Resource> {
    state: Mutex<State<R>>,
}

fn ns_matches(namespace: Option<&str>, id: &ResourceIdentity) -> bool {
    match namespace {
        Some(ns) if !ns.is_empty() => id.namespace == ns,
        _ => true,
    }
}

fn event_identity<R: Resource>(ev: &WatchEvent<R>) -> Option<&ResourceIdentity> {
    match ev {
        WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => Some(r.identity()),
        WatchEvent::Bookmark(_) => None,
    }
}

impl<R: Resource> Default for MemoryApi<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Resource> MemoryApi<R> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(HISTORY_CAP);
        Self {
            state: Mutex::new(State {
                items: BTreeMap::new(),
                version: 0,
                history: VecDeque::new(),
                floor: 0,
                events,
                failures: BTreeMap::new(),
                calls: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<R>> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enter(st: &mut State<R>, op: Op) -> StoreResult<()> {
        *st.calls.entry(op).or_default() += 1;
        if let Some(n) = st.failures.get_mut(&op) {
            if *n > 0 {
                *n -= 1;
                return Err(StoreError::Api { code: 503, message: format!("injected {:?} failure", op) });
            }
        }
        Ok(())
    }

    fn emit(st: &mut State<R>, mut rec: R, wrap: fn(R) -> WatchEvent<R>) -> R {
        st.version += 1;
        let version = st.version;
        rec.meta_mut().resource_version = version.to_string();
        let ev = wrap(rec.clone());
        st.history.push_back((version, ev.clone()));
        while st.history.len() > HISTORY_CAP {
            if let Some((v, _)) = st.history.pop_front() {
                st.floor = v;
            }
        }
        let _ = st.events.send((version, ev));
        rec
    }

    /// Create or replace `record` as an external writer would, ignoring its version.
    pub fn put(&self, mut record: R) -> R {
        let mut st = self.lock();
        let id = record.identity().clone();
        let wrap: fn(R) -> WatchEvent<R> = match st.items.get(&id) {
            Some(existing) => {
                record.meta_mut().uid = existing.meta().uid.clone();
                WatchEvent::Modified
            }
            None => {
                if record.meta().uid.is_empty() {
                    record.meta_mut().uid = Uuid::new_v4().to_string();
                }
                WatchEvent::Added
            }
        };
        let stored = Self::emit(&mut st, record, wrap);
        st.items.insert(id, stored.clone());
        stored
    }

    /// Delete as an external writer would.
    pub fn remove(&self, id: &ResourceIdentity) -> Option<R> {
        let mut st = self.lock();
        let existing = st.items.remove(id)?;
        Some(Self::emit(&mut st, existing, WatchEvent::Deleted))
    }

    pub fn snapshot(&self, id: &ResourceIdentity) -> Option<R> {
        self.lock().items.get(id).cloned()
    }

    pub fn all(&self) -> Vec<R> {
        self.lock().items.values().cloned().collect()
    }

    /// Make the next `n` calls of `op` fail with a 503.
    pub fn fail_next(&self, op: Op, n: u32) {
        self.lock().failures.insert(op, n);
    }

    pub fn calls(&self, op: Op) -> u64 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// End every open watch stream, as a server-side watch timeout would.
    pub fn close_watches(&self) {
        let (events, _) = broadcast::channel(HISTORY_CAP);
        self.lock().events = events;
    }

    /// Drop all event history so any resume forces a relist.
    pub fn compact(&self) {
        let mut st = self.lock();
        st.history.clear();
        st.floor = st.version;
        let (events, _) = broadcast::channel(HISTORY_CAP);
        st.events = events;
    }
}

#[async_trait::async_trait]
impl<R: Resource> ResourceApi<R> for MemoryApi<R> {
    async fn list(&self, namespace: Option<&str>) -> StoreResult<Listing<R>> {
        let mut st = self.lock();
        Self::enter(&mut st, Op::List)?;
        let items = st.items.values().filter(|r| ns_matches(namespace, r.identity())).cloned().collect();
        Ok(Listing { resource_version: st.version.to_string(), items })
    }

    async fn watch(&self, namespace: Option<&str>, from_version: &str) -> StoreResult<WatchStream<R>> {
        let mut st = self.lock();
        Self::enter(&mut st, Op::Watch)?;
        let from: u64 = from_version
            .parse()
            .map_err(|_| StoreError::Decode(format!("bad resource version {:?}", from_version)))?;
        if from < st.floor {
            return Err(StoreError::Expired(format!("version {} is older than {}", from, st.floor)));
        }
        let ns = namespace.map(|s| s.to_string());
        let replay: Vec<Versioned<R>> = st
            .history
            .iter()
            .filter(|(v, _)| *v > from)
            .cloned()
            .collect();
        let rx = st.events.subscribe();
        drop(st);

        let live = futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(item) => Some((Ok(item), rx)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    let err = StoreError::Expired(format!("watcher lagged by {} events", n));
                    Some((Err(err), rx))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        let mut failed = false;
        let stream = futures::stream::iter(replay.into_iter().map(Ok))
            .chain(live)
            .take_while(move |item| {
                let keep = !failed;
                failed |= item.is_err();
                futures::future::ready(keep)
            })
            .filter_map(move |item| {
                let out = match item {
                    Ok((v, ev)) if v > from => match event_identity(&ev) {
                        Some(id) if !ns_matches(ns.as_deref(), id) => None,
                        _ => Some(Ok(ev)),
                    },
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                };
                futures::future::ready(out)
            });
        Ok(stream.boxed())
    }

    async fn get(&self, id: &ResourceIdentity) -> StoreResult<Option<R>> {
        let mut st = self.lock();
        Self::enter(&mut st, Op::Get)?;
        Ok(st.items.get(id).cloned())
    }

    async fn create(&self, record: &R) -> StoreResult<R> {
        let mut st = self.lock();
        Self::enter(&mut st, Op::Create)?;
        let id = record.identity().clone();
        if st.items.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id.key()));
        }
        let mut rec = record.clone();
        rec.meta_mut().uid = Uuid::new_v4().to_string();
        let stored = Self::emit(&mut st, rec, WatchEvent::Added);
        st.items.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update_status(&self, record: &R) -> StoreResult<R> {
        let mut st = self.lock();
        Self::enter(&mut st, Op::UpdateStatus)?;
        let id = record.identity().clone();
        let mut current = st.items.get(&id).cloned().ok_or_else(|| StoreError::NotFound(id.key()))?;
        if !record.resource_version().is_empty() && record.resource_version() != current.resource_version() {
            return Err(StoreError::Conflict(format!(
                "{}: version {} does not match {}",
                id,
                record.resource_version(),
                current.resource_version()
            )));
        }
        current.take_status_from(record);
        let stored = Self::emit(&mut st, current, WatchEvent::Modified);
        st.items.insert(id, stored.clone());
        Ok(stored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Establish {
    /// Conditions turn true after this many reads of the definition.
    AfterGets(u32),
    Never,
}

/// Definition registry that marks definitions established.
pub struct MemoryDefinitions {
    state: Mutex<DefState>,
}

struct DefState {
    crds: BTreeMap<String, CustomResourceDefinition>,
    gets: BTreeMap<String, u32>,
    mode: Establish,
    version: u64,
    creates: u64,
    patches: u64,
}

fn established_status() -> CustomResourceDefinitionStatus {
    let cond = |t: &str| CustomResourceDefinitionCondition {
        type_: t.to_string(),
        status: "True".to_string(),
        ..Default::default()
    };
    CustomResourceDefinitionStatus {
        conditions: Some(vec![cond("NamesAccepted"), cond("Established")]),
        ..Default::default()
    }
}

impl Default for MemoryDefinitions {
    fn default() -> Self {
        Self::established_after(0)
    }
}

impl MemoryDefinitions {
    pub fn established_after(gets: u32) -> Self {
        Self::with_mode(Establish::AfterGets(gets))
    }

    pub fn never_established() -> Self {
        Self::with_mode(Establish::Never)
    }

    fn with_mode(mode: Establish) -> Self {
        Self {
            state: Mutex::new(DefState {
                crds: BTreeMap::new(),
                gets: BTreeMap::new(),
                mode,
                version: 0,
                creates: 0,
                patches: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DefState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn creates(&self) -> u64 { self.lock().creates }
    pub fn patches(&self) -> u64 { self.lock().patches }

    pub fn stored(&self, name: &str) -> Option<CustomResourceDefinition> {
        self.lock().crds.get(name).cloned()
    }
}

#[async_trait::async_trait]
impl DefinitionApi for MemoryDefinitions {
    async fn get(&self, name: &str) -> StoreResult<Option<CustomResourceDefinition>> {
        let mut st = self.lock();
        let mode = st.mode;
        let seen = {
            let n = st.gets.entry(name.to_string()).or_default();
            *n += 1;
            *n
        };
        let Some(crd) = st.crds.get_mut(name) else { return Ok(None) };
        if let Establish::AfterGets(after) = mode {
            if seen > after && crd.status.is_none() {
                crd.status = Some(established_status());
            }
        }
        Ok(Some(crd.clone()))
    }

    async fn create(&self, crd: &CustomResourceDefinition) -> StoreResult<CustomResourceDefinition> {
        let mut st = self.lock();
        let name = crd.metadata.name.clone().unwrap_or_default();
        if st.crds.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }
        st.version += 1;
        st.creates += 1;
        let mut stored = crd.clone();
        stored.metadata.uid = Some(Uuid::new_v4().to_string());
        stored.metadata.resource_version = Some(st.version.to_string());
        stored.status = None;
        st.crds.insert(name, stored.clone());
        Ok(stored)
    }

    async fn patch(&self, name: &str, crd: &CustomResourceDefinition) -> StoreResult<CustomResourceDefinition> {
        let mut st = self.lock();
        st.version += 1;
        st.patches += 1;
        let version = st.version;
        let existing = st.crds.get_mut(name).ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if crd.metadata.uid.is_some() && crd.metadata.uid != existing.metadata.uid {
            return Err(StoreError::Conflict(format!("uid mismatch for {}", name)));
        }
        existing.spec = crd.spec.clone();
        existing.metadata.resource_version = Some(version.to_string());
        Ok(existing.clone())
    }
}

/// Both kinds plus the definition registry, wired like a tiny cluster.
#[derive(Clone)]
pub struct MemoryStore {
    pub echoes: Arc<MemoryApi<EchoRecord>>,
    pub children: Arc<MemoryApi<ChildRecord>>,
    pub definitions: Arc<MemoryDefinitions>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            echoes: Arc::new(MemoryApi::new()),
            children: Arc::new(MemoryApi::new()),
            definitions: Arc::new(MemoryDefinitions::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ResourceIdentity {
        ResourceIdentity::new("default", name)
    }

    #[tokio::test]
    async fn versions_increase_and_create_is_exclusive() {
        let api: MemoryApi<EchoRecord> = MemoryApi::new();
        let a = api.create(&EchoRecord::new(id("a"), "x")).await.unwrap();
        assert_eq!(a.meta.resource_version, "1");
        assert!(!a.meta.uid.is_empty());
        let dup = api.create(&EchoRecord::new(id("a"), "y")).await;
        assert!(matches!(dup, Err(StoreError::AlreadyExists(_))));
        let b = api.put(EchoRecord::new(id("a"), "z"));
        assert_eq!(b.meta.resource_version, "2");
        assert_eq!(b.meta.uid, a.meta.uid);
    }

    #[tokio::test]
    async fn status_update_checks_version_and_keeps_spec() {
        let api: MemoryApi<EchoRecord> = MemoryApi::new();
        let stored = api.put(EchoRecord::new(id("a"), "hi"));
        let mut stale = stored.clone();
        stale.meta.resource_version = "0".into();
        stale.status = Some(ekko_core::EchoStatus { child_name: "a-pod".into() });
        assert!(matches!(api.update_status(&stale).await, Err(StoreError::Conflict(_))));

        let mut fresh = stored.clone();
        fresh.spec.message = "ignored".into();
        fresh.status = Some(ekko_core::EchoStatus { child_name: "a-pod".into() });
        let updated = api.update_status(&fresh).await.unwrap();
        assert_eq!(updated.spec.message, "hi");
        assert_eq!(updated.child_name(), Some("a-pod"));
    }

    #[tokio::test]
    async fn watch_replays_history_then_streams_live() {
        let api: MemoryApi<EchoRecord> = MemoryApi::new();
        api.put(EchoRecord::new(id("a"), "1"));
        let mut w = api.watch(Some("default"), "0").await.unwrap();
        api.put(EchoRecord::new(ResourceIdentity::new("other", "skip"), "x"));
        api.remove(&id("a"));
        assert!(matches!(w.next().await, Some(Ok(WatchEvent::Added(_)))));
        assert!(matches!(w.next().await, Some(Ok(WatchEvent::Deleted(_)))));
        api.close_watches();
        assert!(w.next().await.is_none());
    }

    #[tokio::test]
    async fn compacted_history_expires_old_versions() {
        let api: MemoryApi<EchoRecord> = MemoryApi::new();
        api.put(EchoRecord::new(id("a"), "1"));
        api.compact();
        assert!(matches!(api.watch(None, "0").await, Err(StoreError::Expired(_))));
        assert!(api.watch(None, "1").await.is_ok());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let api: MemoryApi<ChildRecord> = MemoryApi::new();
        api.fail_next(Op::Get, 1);
        assert!(api.get(&id("x")).await.is_err());
        assert!(api.get(&id("x")).await.unwrap().is_none());
        assert_eq!(api.calls(Op::Get), 2);
    }
}
