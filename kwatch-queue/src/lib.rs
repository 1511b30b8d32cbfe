//! # kwatch-queue
//!
//! Coalescing, rate-limited, shutdown-aware work queue.
//!
//! [`WorkQueue`] holds distinct keys: a key added while it is already queued
//! is dropped, and a key added while it is being processed is marked dirty and
//! handed out again once [`WorkQueue::done`] is called. [`RateLimitingQueue`]
//! layers per-key retry backoff on top via a [`RateLimiter`].

pub mod limited;
pub mod queue;
pub mod rate_limit;

pub use limited::RateLimitingQueue;
pub use queue::WorkQueue;
pub use rate_limit::{
    default_rate_limiter, BucketRateLimiter, ExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter,
};
