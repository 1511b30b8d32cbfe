//! List-then-watch loop for one kind.
//!
//! Installs a snapshot into the indexer, enqueues whatever differs, then
//! follows the change stream. When the stream ends the loop waits out the
//! relist delay and starts over from a fresh snapshot. Failed attempts that
//! made no progress count against `max_consecutive_failures`; reaching it
//! ends the loop for this kind only.

use std::sync::Arc;

use tokio::sync::broadcast;

use kwatch_core::{ChangeKind, KindTag, ObjectKey, RelistConfig, Resource};
use kwatch_queue::RateLimitingQueue;

use crate::cache::Indexer;
use crate::error::{EngineError, SourceError};
use crate::ledger::ChangeLedger;
use crate::source::{EventStream, ListOptions, SourceAdapter, WatchEvent};

enum StreamEnd {
    Shutdown,
    Closed,
    Failed(SourceError),
}

pub(crate) struct Informer<T: Resource> {
    pub(crate) kind: KindTag,
    pub(crate) source: Arc<dyn SourceAdapter<T>>,
    pub(crate) indexer: Arc<Indexer<T>>,
    pub(crate) ledger: Arc<ChangeLedger>,
    pub(crate) queue: Arc<RateLimitingQueue<ObjectKey>>,
    pub(crate) options: ListOptions,
    pub(crate) relist: RelistConfig,
}

impl<T: Resource> Informer<T> {
    pub(crate) async fn run(
        self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), EngineError> {
        let mut failures: u32 = 0;
        let mut first = true;

        loop {
            if !first {
                let delay = self.relist.delay_for(failures);
                tracing::debug!(kind = %self.kind, delay_ms = delay.as_millis() as u64, failures, "relisting after delay");
                tokio::select! {
                    _ = shutdown_rx.recv() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            first = false;

            let opened = tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                opened = self.list_and_open() => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(err) => {
                    failures += 1;
                    tracing::warn!(kind = %self.kind, failures, error = %err, "list and watch failed");
                    self.check_budget(failures, err)?;
                    continue;
                }
            };

            let (end, received) = self.consume(&mut stream, &mut shutdown_rx).await;
            match end {
                StreamEnd::Shutdown => return Ok(()),
                StreamEnd::Closed => {
                    failures = 0;
                    tracing::info!(kind = %self.kind, received, "change stream closed, relisting");
                }
                StreamEnd::Failed(err) if received > 0 => {
                    failures = 0;
                    tracing::warn!(kind = %self.kind, received, error = %err, "change stream broke, relisting");
                }
                StreamEnd::Failed(err) => {
                    failures += 1;
                    tracing::warn!(kind = %self.kind, failures, error = %err, "change stream broke before delivering events");
                    self.check_budget(failures, err)?;
                }
            }
        }
    }

    fn check_budget(&self, failures: u32, err: SourceError) -> Result<(), EngineError> {
        if failures >= self.relist.max_consecutive_failures {
            tracing::error!(kind = %self.kind, failures, error = %err, "source unavailable, stopping watch for kind");
            return Err(EngineError::SourceUnavailable {
                kind: self.kind.clone(),
                failures,
                source: err,
            });
        }
        Ok(())
    }

    async fn list_and_open(&self) -> Result<EventStream<T>, SourceError> {
        let snapshot = self.source.snapshot(&self.kind, &self.options).await?;
        let listed = snapshot.objects.len();
        let deltas = self.indexer.replace(snapshot.objects);
        tracing::debug!(
            kind = %self.kind,
            position = %snapshot.position,
            listed,
            changed = deltas.len(),
            "snapshot installed",
        );
        for delta in deltas {
            self.enqueue(delta.key, delta.kind);
        }
        self.source
            .stream(&self.kind, &snapshot.position, &self.options)
            .await
    }

    async fn consume(
        &self,
        stream: &mut EventStream<T>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> (StreamEnd, u64) {
        let mut received = 0;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return (StreamEnd::Shutdown, received),
                item = stream.recv() => match item {
                    None => return (StreamEnd::Closed, received),
                    Some(Err(err)) => return (StreamEnd::Failed(err), received),
                    Some(Ok(event)) => {
                        received += 1;
                        self.apply(event);
                    }
                },
            }
        }
    }

    fn apply(&self, event: WatchEvent<T>) {
        if !self.options.matches(&event.object) {
            return;
        }
        let notification = event.notification(&self.kind);
        if self.indexer.apply(&notification, event.object) {
            self.enqueue(notification.key, notification.kind);
        } else {
            tracing::trace!(kind = %self.kind, key = %notification.key, "ignoring event with no new state");
        }
    }

    fn enqueue(&self, key: ObjectKey, change: ChangeKind) {
        self.ledger.record(key.clone(), change);
        self.queue.add(key);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kwatch_core::GenericObject;
    use kwatch_queue::ExponentialFailureRateLimiter;

    use super::*;
    use crate::memory::MemorySource;

    fn pod(name: &str, rv: &str) -> GenericObject {
        GenericObject::new(Some("ns"), name, rv)
    }

    fn informer(source: Arc<MemorySource<GenericObject>>, relist: RelistConfig) -> Informer<GenericObject> {
        let kind = KindTag::from("pod");
        Informer {
            indexer: Arc::new(Indexer::new(kind.clone())),
            kind,
            source,
            ledger: Arc::new(ChangeLedger::new()),
            queue: Arc::new(RateLimitingQueue::new(ExponentialFailureRateLimiter::new(
                Duration::from_millis(5),
                Duration::from_secs(1),
            ))),
            options: ListOptions::default(),
            relist,
        }
    }

    fn quick_relist(max_consecutive_failures: u32) -> RelistConfig {
        RelistConfig {
            initial_delay_ms: 10,
            max_delay_secs: 1,
            max_consecutive_failures,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_then_stream_events_are_enqueued_once() {
        let source = Arc::new(MemorySource::with_objects([pod("a", "1")]));
        let informer = informer(source.clone(), quick_relist(3));
        let indexer = informer.indexer.clone();
        let ledger = informer.ledger.clone();
        let queue = informer.queue.clone();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(informer.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(1)).await;
        source.update(pod("a", "2"));
        source.update(pod("a", "3"));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(indexer.has_synced());
        assert_eq!(queue.len(), 1, "changes to one key coalesce");
        let pending = ledger.take(&ObjectKey::namespaced("ns", "a")).expect("pending");
        assert_eq!(pending.kind, ChangeKind::Created);
        assert!(pending.updated_after_create);

        let _ = shutdown_tx.send(());
        task.await.expect("join").expect("clean exit");
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_triggers_relist() {
        let source = Arc::new(MemorySource::with_objects([pod("a", "1")]));
        let informer = informer(source.clone(), quick_relist(3));
        let indexer = informer.indexer.clone();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(informer.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(source.snapshot_calls(), 1);
        source.disconnect();
        source.seed(pod("b", "1"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(source.snapshot_calls(), 2);
        assert_eq!(source.open_streams(), 1);
        assert_eq!(indexer.len(), 2);

        let _ = shutdown_tx.send(());
        task.await.expect("join").expect("clean exit");
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_snapshot_failure_is_fatal() {
        let source: Arc<MemorySource<GenericObject>> = Arc::new(MemorySource::new());
        source.fail_snapshots(u32::MAX);
        let informer = informer(source.clone(), quick_relist(3));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let err = informer.run(shutdown_rx).await.unwrap_err();
        match err {
            EngineError::SourceUnavailable { kind, failures, .. } => {
                assert_eq!(kind, KindTag::from("pod"));
                assert_eq!(failures, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(source.snapshot_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_recover() {
        let source = Arc::new(MemorySource::with_objects([pod("a", "1")]));
        source.fail_snapshots(2);
        let informer = informer(source.clone(), quick_relist(3));
        let indexer = informer.indexer.clone();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(informer.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(indexer.has_synced());
        assert_eq!(source.snapshot_calls(), 3);

        let _ = shutdown_tx.send(());
        task.await.expect("join").expect("clean exit");
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_stream_failure_is_fatal() {
        let source = Arc::new(MemorySource::with_objects([pod("a", "1")]));
        source.fail_streams(u32::MAX);
        let informer = informer(source.clone(), quick_relist(3));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let err = informer.run(shutdown_rx).await.unwrap_err();
        assert!(
            matches!(err, EngineError::SourceUnavailable { failures: 3, .. }),
            "unexpected error: {err}"
        );
        assert_eq!(source.snapshot_calls(), 3);
        assert_eq!(source.stream_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_stream_after_events_relists_without_giving_up() {
        let source = Arc::new(MemorySource::with_objects([pod("a", "1")]));
        let informer = informer(source.clone(), quick_relist(3));
        let indexer = informer.indexer.clone();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(informer.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(1)).await;

        for round in 0..5u32 {
            let rv = (round + 2).to_string();
            source.update(pod("a", &rv));
            tokio::time::sleep(Duration::from_millis(1)).await;
            source.break_streams("connection reset");
            tokio::time::sleep(Duration::from_millis(50)).await;

            assert!(!task.is_finished(), "round {round} ended the watch");
            assert_eq!(source.snapshot_calls(), round + 2);
            assert_eq!(source.open_streams(), 1);
            let key = ObjectKey::namespaced("ns", "a");
            assert_eq!(indexer.get(&key).expect("cached").resource_version, rv);
        }

        let _ = shutdown_tx.send(());
        task.await.expect("join").expect("clean exit");
    }

    #[tokio::test(start_paused = true)]
    async fn broken_stream_before_events_counts_toward_budget() {
        let source = Arc::new(MemorySource::with_objects([pod("a", "1")]));
        let informer = informer(source.clone(), quick_relist(3));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(informer.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(1)).await;

        for _ in 0..2 {
            source.break_streams("connection reset");
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(!task.is_finished());
        }
        source.break_streams("connection reset");

        let err = task.await.expect("join").unwrap_err();
        match err {
            EngineError::SourceUnavailable {
                failures,
                source: SourceError::Stream(message),
                ..
            } => {
                assert_eq!(failures, 3);
                assert_eq!(message, "connection reset");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(source.snapshot_calls(), 3);
    }
}
