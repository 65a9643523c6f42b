//! Ekko work queue.
//!
//! Keys move through `absent -> queued -> processing -> absent`. An `add` of a
//! key that is being processed marks it dirty instead of queueing it twice;
//! `done` puts a dirty key back on the queue. So a key is never handed to two
//! workers at once, and a change that arrives mid-flight triggers exactly one
//! more pass.

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::debug;

pub mod rate_limiter;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter,
};

/// Bounds every queue key satisfies.
pub trait QueueKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static> QueueKey for T {}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need processing: queued ones and processing-dirty ones.
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    queued_at: FxHashMap<K, Instant>,
    shutting_down: bool,
}

struct Shared<K> {
    name: &'static str,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<K>>,
    delayed: Mutex<Option<mpsc::UnboundedSender<(K, Instant)>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Deduplicating, rate-limited work queue. Cloning yields another handle to
/// the same queue.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a queue and spawn its delayed-add loop on the current Tokio runtime.
    pub fn new(name: &'static str, limiter: impl RateLimiter<K> + 'static) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            name,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                queued_at: FxHashMap::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: Box::new(limiter),
            delayed: Mutex::new(Some(tx)),
        });
        tokio::spawn(waiting_loop(Arc::downgrade(&shared), rx));
        Self { shared }
    }

    pub fn with_default_rate_limiter(name: &'static str) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: K) {
        let mut st = lock(&self.shared.state);
        if st.shutting_down {
            return;
        }
        if !st.dirty.insert(key.clone()) {
            return;
        }
        counter!("workqueue_adds_total", 1u64, "name" => self.shared.name);
        if st.processing.contains(&key) {
            debug!(queue = self.shared.name, key = ?key, "key in flight; marked dirty");
            return;
        }
        st.queued_at.insert(key.clone(), Instant::now());
        st.queue.push_back(key);
        gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.shared.name);
        drop(st);
        self.shared.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shut down and
    /// holds nothing more to hand out.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = lock(&self.shared.state);
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    if let Some(at) = st.queued_at.remove(&key) {
                        histogram!("workqueue_queue_ms", at.elapsed().as_secs_f64() * 1000.0, "name" => self.shared.name);
                    }
                    gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.shared.name);
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Finish processing `key`. A key re-added while in flight is queued again.
    pub fn done(&self, key: &K) {
        let mut st = lock(&self.shared.state);
        st.processing.remove(key);
        if st.dirty.contains(key) {
            st.queued_at.insert(key.clone(), Instant::now());
            st.queue.push_back(key.clone());
            gauge!("workqueue_depth", st.queue.len() as f64, "name" => self.shared.name);
            drop(st);
            self.shared.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed. A key already waiting keeps the
    /// earlier of the two ready times.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if let Some(tx) = lock(&self.shared.delayed).as_ref() {
            let _ = tx.send((key, Instant::now() + delay));
        }
    }

    /// Re-add `key` after the limiter's backoff for it.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.shared.limiter.when(&key);
        counter!("workqueue_retries_total", 1u64, "name" => self.shared.name);
        debug!(queue = self.shared.name, key = ?key, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Reset the backoff for `key`.
    pub fn forget(&self, key: &K) {
        self.shared.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.shared.limiter.num_requeues(key)
    }

    /// Stop accepting keys and wake every waiter. Keys already queued are
    /// still handed out; pending delayed adds are dropped.
    pub fn shut_down(&self) {
        lock(&self.shared.state).shutting_down = true;
        lock(&self.shared.delayed).take();
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        lock(&self.shared.state).shutting_down
    }

    /// Keys queued and not yet handed out.
    pub fn len(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently handed out and not yet `done`.
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.state).processing.len()
    }
}

/// Holds delayed keys in a min-heap on ready time and adds them when due.
async fn waiting_loop<K: QueueKey>(queue: Weak<Shared<K>>, mut rx: mpsc::UnboundedReceiver<(K, Instant)>) {
    let mut heap: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut entries: FxHashMap<u64, K> = FxHashMap::default();
    let mut waiting: FxHashMap<K, (Instant, u64)> = FxHashMap::default();
    let mut seq: u64 = 0;

    loop {
        let next = heap.peek().map(|Reverse((at, _))| *at);
        tokio::select! {
            msg = rx.recv() => {
                let Some((key, at)) = msg else { break };
                if matches!(waiting.get(&key), Some((existing, _)) if *existing <= at) {
                    continue;
                }
                seq += 1;
                if let Some((_, stale)) = waiting.insert(key.clone(), (at, seq)) {
                    entries.remove(&stale);
                }
                entries.insert(seq, key);
                heap.push(Reverse((at, seq)));
            }
            _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                let Some(shared) = queue.upgrade() else { break };
                let handle = WorkQueue { shared };
                let now = Instant::now();
                while let Some(Reverse((at, id))) = heap.peek().copied() {
                    if at > now {
                        break;
                    }
                    heap.pop();
                    if let Some(key) = entries.remove(&id) {
                        waiting.remove(&key);
                        handle.add(key);
                    }
                }
            }
        }
    }
    debug!(pending = entries.len(), "delayed-add loop stopped");
}
