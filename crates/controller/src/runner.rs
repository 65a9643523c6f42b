use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use ekko_core::{ChildRecord, EchoRecord, KindRegistry};
use ekko_kubehub::ResourceApi;
use ekko_queue::WorkQueue;
use ekko_store::{wait_for_cache_sync, Cache, Informer};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::reconciler::{Action, Reconcile, Reconciler};
use crate::router::{EnqueueParent, OwnershipRouter};

pub const QUEUE_NAME: &str = "echo";

/// Informers, queue and workers wired together.
pub struct Controller {
    config: ControllerConfig,
    parents: Informer<EchoRecord>,
    children: Informer<ChildRecord>,
    queue: WorkQueue<String>,
    reconciler: Arc<dyn Reconcile>,
}

impl Controller {
    /// Must be called inside a Tokio runtime.
    pub fn new(
        config: ControllerConfig,
        registry: KindRegistry,
        echoes: Arc<dyn ResourceApi<EchoRecord>>,
        children: Arc<dyn ResourceApi<ChildRecord>>,
    ) -> Self {
        let queue = WorkQueue::with_default_rate_limiter(QUEUE_NAME);

        let mut parent_informer = Informer::new(Arc::clone(&echoes), config.informer());
        parent_informer.add_handler(Arc::new(EnqueueParent::new(queue.clone())));

        let mut child_informer = Informer::new(Arc::clone(&children), config.informer());
        child_informer.add_handler(Arc::new(OwnershipRouter::new(
            registry.parent().clone(),
            parent_informer.cache(),
            queue.clone(),
        )));

        let reconciler = Arc::new(Reconciler::new(registry, parent_informer.cache(), echoes, children, &config));
        Self { config, parents: parent_informer, children: child_informer, queue, reconciler }
    }

    /// Swap the reconciler, keeping informers and queue.
    pub fn with_reconciler(mut self, reconciler: Arc<dyn Reconcile>) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn queue(&self) -> WorkQueue<String> {
        self.queue.clone()
    }

    pub fn parents(&self) -> Cache<EchoRecord> {
        self.parents.cache()
    }

    pub fn children(&self) -> Cache<ChildRecord> {
        self.children.cache()
    }

    /// Run until `cancel` fires. Fails only if the caches do not sync.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(workers = self.config.workers, namespace = ?self.config.namespace, "starting controller");
        self.parents.start(cancel.clone());
        self.children.start(cancel.clone());

        let gates = [self.parents.gate(), self.children.gate()];
        if !wait_for_cache_sync(self.config.sync_timeout, &cancel, gates).await {
            self.queue.shut_down();
            if cancel.is_cancelled() {
                info!("cancelled before caches synced");
                return Ok(());
            }
            bail!("caches did not sync within {:?}", self.config.sync_timeout);
        }
        info!("caches synced; starting workers");

        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|id| {
                tokio::spawn(run_worker(id, self.queue.clone(), Arc::clone(&self.reconciler), self.config.max_retries))
            })
            .collect();

        cancel.cancelled().await;
        info!(queued = self.queue.len(), "shutting down; draining queue");
        self.queue.shut_down();
        for res in futures::future::join_all(workers).await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
        info!("controller stopped");
        Ok(())
    }
}

async fn run_worker(id: usize, queue: WorkQueue<String>, reconciler: Arc<dyn Reconcile>, max_retries: u32) {
    while let Some(key) = queue.get().await {
        process_item(&queue, reconciler.as_ref(), &key, max_retries).await;
        queue.done(&key);
    }
    debug!(worker = id, "worker finished");
}

/// One pass over `key`, deciding whether and when it comes back.
pub async fn process_item(queue: &WorkQueue<String>, reconciler: &dyn Reconcile, key: &str, max_retries: u32) {
    let t0 = Instant::now();
    let res = reconciler.reconcile(key).await;
    histogram!("reconcile_duration_ms", t0.elapsed().as_secs_f64() * 1000.0);
    let key = key.to_string();
    match res {
        Ok(Action::Done) => {
            counter!("reconcile_total", 1u64, "result" => "ok");
            queue.forget(&key);
        }
        Ok(Action::RequeueAfter(after)) => {
            counter!("reconcile_total", 1u64, "result" => "ok");
            queue.forget(&key);
            queue.add_after(key, after);
        }
        Err(e) if !e.is_retryable() => {
            counter!("reconcile_total", 1u64, "result" => "dropped");
            error!(key = %key, error = %e, "dropping key");
            queue.forget(&key);
        }
        Err(e) => {
            let attempt = queue.num_requeues(&key) + 1;
            if attempt < max_retries {
                counter!("reconcile_total", 1u64, "result" => "retry");
                warn!(key = %key, error = %e, kind = e.label(), attempt, "reconcile failed; retrying");
                queue.add_rate_limited(key);
            } else {
                counter!("reconcile_total", 1u64, "result" => "dropped");
                error!(key = %key, error = %e, attempts = attempt, "giving up on key");
                queue.forget(&key);
            }
        }
    }
}
