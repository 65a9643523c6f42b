#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ekko_controller::{
    build_child, Action, ControllerConfig, OwnershipRouter, Reconcile, ReconcileError, Reconciler,
};
use ekko_core::{ChildRecord, EchoRecord, KindInfo, Listing, Notification, OwnerReference, ResourceIdentity};
use ekko_kubehub::{MemoryApi, MemoryStore, Op, ResourceApi, StoreResult, WatchStream};
use ekko_queue::WorkQueue;
use ekko_store::{Cache, EventHandler, Informer, InformerConfig};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

fn id(name: &str) -> ResourceIdentity {
    ResourceIdentity::new("default", name)
}

struct Harness {
    store: MemoryStore,
    parents: Cache<EchoRecord>,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Harness {
    async fn new() -> Self {
        let store = MemoryStore::new();
        let echoes: Arc<dyn ResourceApi<EchoRecord>> = store.echoes.clone();
        let informer = Informer::new(echoes, InformerConfig { resync: Duration::ZERO, ..InformerConfig::default() });
        let cancel = CancellationToken::new();
        let parents = informer.start(cancel.clone());
        assert!(informer.wait_for_sync(Duration::from_secs(2), &cancel).await);
        Self { store, parents, cancel }
    }

    fn reconciler(&self, config: &ControllerConfig) -> Reconciler {
        self.reconciler_with(self.store.children.clone(), config)
    }

    fn reconciler_with(&self, children: Arc<dyn ResourceApi<ChildRecord>>, config: &ControllerConfig) -> Reconciler {
        Reconciler::new(
            ekko_core::KindRegistry::standard(),
            self.parents.clone(),
            self.store.echoes.clone(),
            children,
            config,
        )
    }

    /// Create a parent and wait until the cache holds it.
    async fn parent(&self, name: &str, message: &str) -> EchoRecord {
        let stored = self.store.echoes.put(EchoRecord::new(id(name), message));
        let rv = stored.meta.resource_version.clone();
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.parents.get(&id(name)).map(|p| p.meta.resource_version.clone()) != Some(rv.clone()) {
            assert!(Instant::now() < deadline, "parent never reached the cache");
            sleep(Duration::from_millis(5)).await;
        }
        stored
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn creates_child_and_records_status() {
    let h = Harness::new().await;
    let parent = h.parent("demo", "hi").await;
    let r = h.reconciler(&ControllerConfig::default());

    let action = r.reconcile("default/demo").await.unwrap();
    assert_eq!(action, Action::RequeueAfter(Duration::from_secs(10)));

    let child = h.store.children.snapshot(&id("demo-pod")).expect("child created");
    assert!(child.is_controlled_by(&parent.meta));
    assert_eq!(child.message, "hi");
    assert_eq!(child.labels.get("app").map(String::as_str), Some("echoserver"));
    assert_eq!(child.labels.get("controller").map(String::as_str), Some("demo"));

    let stored = h.store.echoes.snapshot(&id("demo")).unwrap();
    assert_eq!(stored.child_name(), Some("demo-pod"));
    assert_eq!(stored.spec.message, "hi", "spec untouched");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_pass_writes_nothing() {
    let h = Harness::new().await;
    h.parent("demo", "hi").await;
    let r = h.reconciler(&ControllerConfig::default());

    r.reconcile("default/demo").await.unwrap();
    r.reconcile("default/demo").await.unwrap();
    assert_eq!(h.store.children.calls(Op::Create), 1);
    assert_eq!(h.store.echoes.calls(Op::UpdateStatus), 1);
    assert_eq!(h.store.children.all().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn externally_deleted_child_is_recreated() {
    let h = Harness::new().await;
    let parent = h.parent("demo", "hi").await;
    let r = h.reconciler(&ControllerConfig::default());
    r.reconcile("default/demo").await.unwrap();

    h.store.children.remove(&id("demo-pod"));
    r.reconcile("default/demo").await.unwrap();
    let child = h.store.children.snapshot(&id("demo-pod")).expect("child recreated");
    assert!(child.is_controlled_by(&parent.meta));
    assert_eq!(h.store.children.calls(Op::Create), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_parent_is_done() {
    let h = Harness::new().await;
    let r = h.reconciler(&ControllerConfig::default());
    assert_eq!(r.reconcile("default/ghost").await.unwrap(), Action::Done);
    assert_eq!(h.store.children.calls(Op::Get), 0);
    assert_eq!(h.store.children.calls(Op::Create), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_key_is_not_retryable() {
    let h = Harness::new().await;
    let r = h.reconciler(&ControllerConfig::default());
    for key in ["", "a/b/c", "default/"] {
        let err = r.reconcile(key).await.unwrap_err();
        assert!(matches!(err, ReconcileError::MalformedKey(_)), "{key}: {err}");
        assert!(!err.is_retryable());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn foreign_child_with_our_name_is_rejected() {
    let h = Harness::new().await;
    h.parent("demo", "hi").await;
    h.store.children.put(ChildRecord::new(id("demo-pod")));
    let r = h.reconciler(&ControllerConfig::default());

    let err = r.reconcile("default/demo").await.unwrap_err();
    assert!(matches!(err, ReconcileError::NotControlled { .. }), "{err}");
    assert!(err.is_retryable());
    assert_eq!(h.store.echoes.snapshot(&id("demo")).unwrap().child_name(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_status_write_surfaces_then_heals() {
    let h = Harness::new().await;
    h.parent("demo", "hi").await;
    let r = h.reconciler(&ControllerConfig::default());
    h.store.echoes.fail_next(Op::UpdateStatus, 1);

    let err = r.reconcile("default/demo").await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store(_)));
    assert!(err.is_retryable());

    r.reconcile("default/demo").await.unwrap();
    assert_eq!(h.store.echoes.snapshot(&id("demo")).unwrap().child_name(), Some("demo-pod"));
    assert_eq!(h.store.children.calls(Op::Create), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_requeue_means_done() {
    let h = Harness::new().await;
    h.parent("demo", "hi").await;
    let cfg = ControllerConfig { requeue: Duration::ZERO, ..ControllerConfig::default() };
    assert_eq!(h.reconciler(&cfg).reconcile("default/demo").await.unwrap(), Action::Done);
}

/// Hides the child from the first read, as if another worker created it
/// between our read and our create.
struct RacingChildren {
    inner: Arc<MemoryApi<ChildRecord>>,
    hidden: AtomicBool,
}

#[async_trait]
impl ResourceApi<ChildRecord> for RacingChildren {
    async fn list(&self, namespace: Option<&str>) -> StoreResult<Listing<ChildRecord>> {
        self.inner.list(namespace).await
    }

    async fn watch(&self, namespace: Option<&str>, from_version: &str) -> StoreResult<WatchStream<ChildRecord>> {
        self.inner.watch(namespace, from_version).await
    }

    async fn get(&self, id: &ResourceIdentity) -> StoreResult<Option<ChildRecord>> {
        if !self.hidden.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.get(id).await
    }

    async fn create(&self, record: &ChildRecord) -> StoreResult<ChildRecord> {
        self.inner.create(record).await
    }

    async fn update_status(&self, record: &ChildRecord) -> StoreResult<ChildRecord> {
        self.inner.update_status(record).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_create_counts_as_existing() {
    let h = Harness::new().await;
    let parent = h.parent("demo", "hi").await;
    let registry = ekko_core::KindRegistry::standard();
    h.store.children.put(build_child(&parent, registry.parent(), "img"));

    let racing = Arc::new(RacingChildren { inner: h.store.children.clone(), hidden: AtomicBool::new(false) });
    let r = h.reconciler_with(racing, &ControllerConfig::default());
    r.reconcile("default/demo").await.unwrap();

    assert_eq!(h.store.children.calls(Op::Create), 1, "one create attempt, rejected as existing");
    assert_eq!(h.store.children.all().len(), 1);
    assert_eq!(h.store.echoes.snapshot(&id("demo")).unwrap().child_name(), Some("demo-pod"));
}

fn owned_by(kind: &str, owner: &EchoRecord) -> ChildRecord {
    let mut child = ChildRecord::new(id(&format!("{}-pod", owner.meta.identity.name)));
    child.owner_references.push(OwnerReference {
        api_version: "ekko.dev/v1alpha1".into(),
        kind: kind.into(),
        name: owner.meta.identity.name.clone(),
        uid: owner.meta.uid.clone(),
        controller: true,
        block_owner_deletion: true,
    });
    child
}

fn router(h: &Harness) -> (OwnershipRouter, WorkQueue<String>) {
    let queue = WorkQueue::with_default_rate_limiter("router-test");
    let parent_kind = KindInfo::new("ekko.dev", "v1alpha1", "Echo", "echoes", true);
    (OwnershipRouter::new(parent_kind, h.parents.clone(), queue.clone()), queue)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn router_enqueues_controlling_parent_for_every_variant() {
    let h = Harness::new().await;
    let parent = h.parent("demo", "hi").await;
    let (router, queue) = router(&h);
    let child = Arc::new(owned_by("Echo", &parent));

    for n in [
        Notification::Added(child.clone()),
        Notification::Modified { old: child.clone(), new: child.clone() },
        Notification::Deleted(child.clone()),
        Notification::DeletedFinalStateUnknown(child.clone()),
    ] {
        router.on_event(&n);
        assert_eq!(queue.len(), 1, "{}", n.label());
        let key = queue.get().await.unwrap();
        assert_eq!(key, "default/demo");
        queue.done(&key);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn router_ignores_orphans_foreign_kinds_and_unowned() {
    let h = Harness::new().await;
    let parent = h.parent("demo", "hi").await;
    let (router, queue) = router(&h);

    let mut ghost = parent.clone();
    ghost.meta.identity = id("ghost");
    let cases = [
        owned_by("Echo", &ghost),
        owned_by("ReplicaSet", &parent),
        ChildRecord::new(id("loose-pod")),
    ];
    for child in cases {
        assert_eq!(router.route(&child), None);
        router.on_event(&Notification::Added(Arc::new(child)));
    }
    assert!(queue.is_empty());

    let mut non_controller = owned_by("Echo", &parent);
    non_controller.owner_references[0].controller = false;
    assert_eq!(router.route(&non_controller), None);

    assert_eq!(router.route(&owned_by("Echo", &parent)), Some("default/demo".to_string()));
}
