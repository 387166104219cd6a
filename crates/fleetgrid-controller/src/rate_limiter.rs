//! Rate limiters that decide how long a re-queued key waits.
//!
//! The default controller limiter is the maximum of a per-key exponential
//! failure backoff and an overall token bucket: a single hot key backs off
//! on its own, and a burst of failures across many keys is throttled as a
//! whole.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// Decides the delay before a key is re-added to the queue.
pub trait RateLimiter<K>: Send {
    /// Delay before `key` may be processed again. Counts as one failure.
    fn when(&mut self, key: &K) -> Duration;

    /// Stop tracking `key`, resetting its backoff.
    fn forget(&mut self, key: &K);

    /// Number of failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &K) -> u32;
}

/// Tunables for [`RateLimiterConfig::build`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Backoff after the first failure of a key.
    pub base_delay: Duration,
    /// Ceiling of the per-key backoff.
    pub max_delay: Duration,
    /// Sustained re-queue rate across all keys.
    pub qps: f64,
    /// Re-queues allowed in a burst before `qps` applies.
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
        }
    }
}

impl RateLimiterConfig {
    /// Per-key exponential backoff combined with an overall token bucket.
    pub fn build<K>(&self) -> MaxOfRateLimiter<K>
    where
        K: Eq + Hash + Clone + Send + 'static,
    {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                self.base_delay,
                self.max_delay,
            )),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

// ── Per-key exponential ────────────────────────────────────────────

/// `base * 2^failures`, capped at `max`, tracked per key.
pub struct ItemExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ItemExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&mut self, key: &K) -> Duration {
        let failures = self.failures.entry(key.clone()).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        // Overflow saturates at the cap.
        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |backoff| backoff.min(self.max))
    }

    fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

// ── Token bucket ───────────────────────────────────────────────────

/// Overall token bucket: `burst` immediate re-queues, then `qps`.
///
/// Not keyed, so `forget` and `num_requeues` are no-ops.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&mut self, _key: &K) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);

        // Reserve a token even if that drives the balance negative; the
        // deficit is the wait.
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }

    fn forget(&mut self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

// ── Combinator ─────────────────────────────────────────────────────

/// Waits for the longest delay any inner limiter asks for.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&mut self, key: &K) -> Duration {
        self.limiters
            .iter_mut()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&mut self, key: &K) {
        for limiter in &mut self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}
