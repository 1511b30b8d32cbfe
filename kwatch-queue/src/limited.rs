//! Work queue plus retry policy.

use std::hash::Hash;
use std::time::Duration;

use crate::queue::WorkQueue;
use crate::rate_limit::RateLimiter;

/// A [`WorkQueue`] whose failed keys come back after a backoff delay.
pub struct RateLimitingQueue<K> {
    queue: WorkQueue<K>,
    limiter: Box<dyn RateLimiter<K>>,
}

impl<K: Clone + Eq + Hash> RateLimitingQueue<K> {
    pub fn new(limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            queue: WorkQueue::new(),
            limiter: Box::new(limiter),
        }
    }

    pub fn add(&self, key: K) {
        self.queue.add(key);
    }

    pub fn add_after(&self, key: K, delay: Duration) {
        self.queue.add_after(key, delay);
    }

    /// Re-queue `key` after the delay its failure history calls for.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        tracing::trace!(delay_ms = delay.as_millis() as u64, "scheduling rate-limited retry");
        self.queue.add_after(key, delay);
    }

    /// Reset retry history for `key`. Call on success or final give-up.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    pub async fn get(&self) -> Option<K> {
        self.queue.get().await
    }

    pub fn done(&self, key: &K) {
        self.queue.done(key);
    }

    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn waiting_len(&self) -> usize {
        self.queue.waiting_len()
    }

    pub fn is_processing(&self, key: &K) -> bool {
        self.queue.is_processing(key)
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.queue.is_pending(key)
    }
}
