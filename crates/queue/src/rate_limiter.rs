//! Retry delay policies for [`crate::WorkQueue::add_rate_limited`].

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Decides how long a key waits before it is re-added after a failure.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next retry of `key`; records one more failure.
    fn when(&self, key: &K) -> Duration;
    /// Clear failure tracking for `key`.
    fn forget(&self, key: &K);
    /// Failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &K) -> u32;
}

/// `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K> ItemExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<K: Hash + Eq + Clone + Send + Sync> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let exp = failures.get(key).copied().unwrap_or(0);
        failures.insert(key.clone(), exp.saturating_add(1));
        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }

    fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by all keys: `qps` refill, `burst` capacity.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut b = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
        b.last = now;
        b.tokens = (b.tokens + elapsed * self.qps).min(self.burst) - 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-b.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Worst case of several limiters.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Per-key exponential backoff from 5ms to 1000s, bounded overall by a
/// 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000))),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_cap() {
        let rl = ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_millis(10));
        let delays: Vec<_> = (0..6).map(|_| rl.when(&"k")).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 10, 10].map(Duration::from_millis).to_vec()
        );
        assert_eq!(rl.num_requeues(&"k"), 6);
        rl.forget(&"k");
        assert_eq!(rl.num_requeues(&"k"), 0);
        assert_eq!(rl.when(&"k"), Duration::from_millis(1));
    }

    #[test]
    fn exponential_saturates_instead_of_overflowing() {
        let rl = ItemExponentialFailureRateLimiter::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..100 {
            assert!(rl.when(&1u8) <= Duration::from_secs(60));
        }
    }

    #[test]
    fn keys_back_off_independently() {
        let rl = ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1));
        rl.when(&"a");
        rl.when(&"a");
        assert_eq!(rl.when(&"b"), Duration::from_millis(1));
        assert_eq!(rl.num_requeues(&"a"), 2);
    }

    #[test]
    fn bucket_allows_burst_then_spaces_out() {
        let rl = BucketRateLimiter::new(10.0, 3);
        for _ in 0..3 {
            assert_eq!(RateLimiter::<u8>::when(&rl, &0), Duration::ZERO);
        }
        let d = RateLimiter::<u8>::when(&rl, &0);
        assert!(d > Duration::from_millis(50) && d <= Duration::from_millis(100), "{:?}", d);
    }

    #[test]
    fn max_of_takes_the_longest() {
        let rl: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1))),
            Box::new(ItemExponentialFailureRateLimiter::new(Duration::from_millis(3), Duration::from_secs(1))),
        ]);
        assert_eq!(rl.when(&"k"), Duration::from_millis(3));
        assert_eq!(rl.when(&"k"), Duration::from_millis(6));
        assert_eq!(rl.num_requeues(&"k"), 2);
        rl.forget(&"k");
        assert_eq!(rl.num_requeues(&"k"), 0);
    }
}
