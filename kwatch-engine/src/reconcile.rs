//! The reconcile loop: drain keys, resolve them against the cache, deliver
//! to the handler, and route the result into the queue's retry policy.
//!
//! Per key: `Pending -> Processing -> Succeeded | RetryScheduled -> Pending
//! | GivenUp`. Succeeded and GivenUp both forget the key's retry history.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use kwatch_core::{ChangeKind, ChangeNotification, KindTag, ObjectKey, Resource};
use kwatch_queue::RateLimitingQueue;

use crate::cache::Indexer;
use crate::error::ReconcileError;
use crate::handler::{ErrorSink, FailureReport, Handler, TracingErrorSink};
use crate::ledger::{ChangeLedger, PendingChange};

/// How a successful reconcile step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The handler accepted the change.
    Handled(ChangeKind),
    /// A creation of an object that existed before the engine started; the
    /// handler was not called.
    Skipped,
}

#[derive(Debug, Default)]
pub struct ReconcileStats {
    handled: AtomicU64,
    skipped: AtomicU64,
    retried: AtomicU64,
    given_up: AtomicU64,
}

impl ReconcileStats {
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn given_up(&self) -> u64 {
        self.given_up.load(Ordering::Relaxed)
    }
}

enum Resolved<T> {
    Present { change: ChangeKind, object: Arc<T> },
    Gone { last_known: Option<Arc<T>> },
}

pub struct Reconciler<T: Resource> {
    kind: KindTag,
    indexer: Arc<Indexer<T>>,
    queue: Arc<RateLimitingQueue<ObjectKey>>,
    ledger: Arc<ChangeLedger>,
    handler: Option<Arc<dyn Handler<T>>>,
    error_sink: Arc<dyn ErrorSink>,
    stats: Arc<ReconcileStats>,
    started_at: DateTime<Utc>,
    max_retries: u32,
}

impl<T: Resource> Reconciler<T> {
    /// `max_retries` is the number of delivery attempts a key gets before
    /// the engine gives up on it.
    pub fn new(
        indexer: Arc<Indexer<T>>,
        queue: Arc<RateLimitingQueue<ObjectKey>>,
        ledger: Arc<ChangeLedger>,
        started_at: DateTime<Utc>,
        max_retries: u32,
    ) -> Self {
        Self {
            kind: indexer.kind().clone(),
            indexer,
            queue,
            ledger,
            handler: None,
            error_sink: Arc::new(TracingErrorSink),
            stats: Arc::new(ReconcileStats::default()),
            started_at,
            max_retries,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn Handler<T>>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    pub fn stats(&self) -> Arc<ReconcileStats> {
        self.stats.clone()
    }

    pub async fn run_worker(&self, worker: usize) {
        tracing::debug!(kind = %self.kind, worker, "reconcile worker started");
        while self.process_next().await {}
        tracing::debug!(kind = %self.kind, worker, "reconcile worker stopped");
    }

    /// Process one key. Returns `false` once the queue has shut down and
    /// drained.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.process(key).await;
        true
    }

    async fn process(&self, key: ObjectKey) {
        let pending = self
            .ledger
            .take(&key)
            .unwrap_or_else(|| self.infer(&key));
        let attempts = self.queue.num_requeues(&key).saturating_add(1);

        match self.reconcile(&key, pending).await {
            Ok(outcome) => {
                match outcome {
                    Outcome::Handled(change) => {
                        self.stats.handled.fetch_add(1, Ordering::Relaxed);
                        if change == ChangeKind::Deleted {
                            self.release_tombstone(&key);
                        }
                        tracing::debug!(kind = %self.kind, key = %key, %change, attempts, "change delivered");
                    }
                    Outcome::Skipped => {
                        self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(kind = %self.kind, key = %key, "skipped creation of object that predates engine start");
                    }
                }
                self.queue.forget(&key);
                self.queue.done(&key);
            }
            Err(err) if err.is_retryable() && attempts < self.max_retries => {
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    kind = %self.kind,
                    key = %key,
                    attempt = attempts,
                    max_retries = self.max_retries,
                    error = %err,
                    "reconcile failed, retrying with backoff",
                );
                self.ledger.restore(key.clone(), pending);
                self.queue.done(&key);
                self.queue.add_rate_limited(key);
            }
            Err(err) => {
                self.stats.given_up.fetch_add(1, Ordering::Relaxed);
                let change = err.change();
                if change == ChangeKind::Deleted {
                    self.release_tombstone(&key);
                }
                self.queue.forget(&key);
                self.queue.done(&key);
                self.error_sink.report(FailureReport {
                    kind: self.kind.clone(),
                    key,
                    change,
                    attempts,
                    error: err.to_string(),
                });
            }
        }
    }

    /// Deliver one pending change for `key`.
    pub async fn reconcile(
        &self,
        key: &ObjectKey,
        pending: PendingChange,
    ) -> Result<Outcome, ReconcileError> {
        match self.resolve(key, pending.kind) {
            Resolved::Gone { last_known } => {
                let change = ChangeKind::Deleted;
                let handler = self.handler(change)?;
                handler
                    .on_delete(&self.notification(key, change), last_known.as_deref())
                    .await
                    .map_err(|source| ReconcileError::Handler { change, source })?;
                Ok(Outcome::Handled(change))
            }
            Resolved::Present { change, object } => {
                let change = match change {
                    ChangeKind::Created if self.is_startup_replay(&object) => {
                        if !pending.updated_after_create {
                            return Ok(Outcome::Skipped);
                        }
                        ChangeKind::Updated
                    }
                    other => other,
                };
                let handler = self.handler(change)?;
                let notification = self.notification(key, change);
                let result = if change == ChangeKind::Created {
                    handler.on_create(&notification, &object).await
                } else {
                    handler.on_update(&notification, &object).await
                };
                result.map_err(|source| ReconcileError::Handler { change, source })?;
                Ok(Outcome::Handled(change))
            }
        }
    }

    /// An object whose creation is not strictly after engine start was
    /// already there; announcing it as new would replay the whole store.
    fn is_startup_replay(&self, object: &T) -> bool {
        match object.creation_timestamp() {
            Some(created) => created <= self.started_at,
            None => true,
        }
    }

    fn resolve(&self, key: &ObjectKey, change: ChangeKind) -> Resolved<T> {
        if change != ChangeKind::Deleted {
            if let Some(object) = self.indexer.get(key) {
                return Resolved::Present { change, object };
            }
        }
        Resolved::Gone {
            last_known: self.indexer.tombstone(key),
        }
    }

    fn infer(&self, key: &ObjectKey) -> PendingChange {
        if self.indexer.get(key).is_some() {
            PendingChange::new(ChangeKind::Updated)
        } else {
            PendingChange::new(ChangeKind::Deleted)
        }
    }

    fn handler(&self, change: ChangeKind) -> Result<&Arc<dyn Handler<T>>, ReconcileError> {
        self.handler
            .as_ref()
            .ok_or_else(|| ReconcileError::MissingHandler {
                kind: self.kind.clone(),
                change,
            })
    }

    fn notification(&self, key: &ObjectKey, change: ChangeKind) -> ChangeNotification {
        ChangeNotification::new(key.clone(), change, self.kind.clone())
    }

    /// A newer change queued while this delete was in flight still needs
    /// the tombstone.
    fn release_tombstone(&self, key: &ObjectKey) {
        if !self.queue.is_pending(key) {
            self.indexer.purge_tombstone(key);
        }
    }
}
