//! Retry delay policies.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kwatch_core::BackoffConfig;
use tokio::time::Instant;

/// Decides how long a failed key waits before it is retried.
pub trait RateLimiter<K>: Send + Sync {
    /// Record a failure for `key` and return the delay before its retry.
    fn when(&self, key: &K) -> Duration;

    /// Failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &K) -> u32;

    /// Clear all history for `key`.
    fn forget(&self, key: &K);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Per-key exponential backoff
// ---------------------------------------------------------------------------

/// `base * 2^failures`, capped at `max`, tracked per key.
pub struct ExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash> ExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Clone + Eq + Hash + Send> RateLimiter<K> for ExponentialFailureRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        let backoff = self.base.as_secs_f64() * 2f64.powi(exp.min(1024) as i32);
        if !backoff.is_finite() || backoff >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(backoff)
    }

    fn num_requeues(&self, key: &K) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }

    fn forget(&self, key: &K) {
        lock(&self.failures).remove(key);
    }
}

// ---------------------------------------------------------------------------
// Overall token bucket
// ---------------------------------------------------------------------------

struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

/// Caps the overall retry rate across all keys: `burst` retries may go out
/// immediately, after which they are spaced at `qps`. No single wait
/// exceeds `max_delay`.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    max_delay: Duration,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            max_delay: Duration::MAX,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                refreshed: Instant::now(),
            }),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.refreshed).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.refreshed = now;

        // Reserve a token even if it has to be borrowed from the future.
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            // A vanishing qps overflows to infinity.
            Duration::try_from_secs_f64(-bucket.tokens / self.qps)
                .map_or(self.max_delay, |delay| delay.min(self.max_delay))
        }
    }

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }

    fn forget(&self, _key: &K) {}
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// The slowest of several limiters.
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
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }
}

/// Per-key exponential backoff combined with an overall token bucket.
pub fn default_rate_limiter<K>(backoff: &BackoffConfig) -> MaxOfRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ExponentialFailureRateLimiter::new(
            backoff.base_delay(),
            backoff.max_delay(),
        )),
        Box::new(
            BucketRateLimiter::new(backoff.qps, backoff.burst)
                .with_max_delay(backoff.max_delay()),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_per_failure_and_caps() {
        let limiter =
            ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        let delays: Vec<_> = (0..10).map(|_| limiter.when(&"k")).collect();
        assert_eq!(delays[0], Duration::from_millis(5));
        assert_eq!(delays[1], Duration::from_millis(10));
        assert_eq!(delays[2], Duration::from_millis(20));
        assert_eq!(delays[7], Duration::from_millis(640));
        assert_eq!(delays[8], Duration::from_secs(1));
        assert_eq!(delays[9], Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&"k"), 10);
    }

    #[test]
    fn exponential_tracks_keys_independently() {
        let limiter =
            ExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(10));
        limiter.when(&"a");
        limiter.when(&"a");
        limiter.when(&"b");
        assert_eq!(limiter.num_requeues(&"a"), 2);
        assert_eq!(limiter.num_requeues(&"b"), 1);

        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(1));
        assert_eq!(limiter.num_requeues(&"b"), 1);
    }

    #[test]
    fn exponential_survives_huge_failure_counts() {
        let limiter =
            ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        for _ in 0..2000 {
            limiter.when(&0u8);
        }
        assert_eq!(limiter.when(&0u8), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_spaces_requests() {
        let limiter = BucketRateLimiter::new(10.0, 2);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"x"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"y"), Duration::ZERO);
        let third = RateLimiter::<&str>::when(&limiter, &"z");
        assert!(
            third > Duration::from_millis(90) && third <= Duration::from_millis(100),
            "third request should wait ~1/qps, got {third:?}"
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"x"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn max_of_picks_slowest_and_forgets_everywhere() {
        let limiter: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ExponentialFailureRateLimiter::new(
                Duration::from_millis(50),
                Duration::from_secs(10),
            )),
            Box::new(BucketRateLimiter::new(100.0, 100)),
        ]);
        assert_eq!(limiter.when(&"k"), Duration::from_millis(50));
        assert_eq!(limiter.when(&"k"), Duration::from_millis(100));
        assert_eq!(limiter.num_requeues(&"k"), 2);
        limiter.forget(&"k");
        assert_eq!(limiter.num_requeues(&"k"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn default_limiter_follows_backoff_config() {
        let limiter: MaxOfRateLimiter<String> = default_rate_limiter(&BackoffConfig::default());
        let key = "ns/a".to_string();
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
        assert_eq!(limiter.when(&key), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues(&key), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_wait_is_capped_when_qps_vanishes() {
        let limiter = BucketRateLimiter::new(1e-320, 1).with_max_delay(Duration::from_secs(1000));
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"x"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"y"), Duration::from_secs(1000));
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"z"), Duration::from_secs(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_wait_never_exceeds_max_delay() {
        let limiter = BucketRateLimiter::new(0.5, 1).with_max_delay(Duration::from_secs(3));
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"x"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"x"), Duration::from_secs(2));
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"x"), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn default_limiter_tolerates_tiny_qps() {
        let backoff = BackoffConfig {
            qps: 1e-320,
            burst: 1,
            ..BackoffConfig::default()
        };
        let limiter: MaxOfRateLimiter<String> = default_rate_limiter(&backoff);
        let key = "ns/a".to_string();
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
        assert_eq!(limiter.when(&key), backoff.max_delay());
    }
}
