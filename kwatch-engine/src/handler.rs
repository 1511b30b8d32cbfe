//! Business-logic boundary and the give-up reporting side channel.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use kwatch_core::{ChangeKind, ChangeNotification, KindTag, ObjectKey, Resource};

use crate::error::HandlerError;

/// Reacts to detected changes. Called with a shared, read-only view of the
/// cached object; an `Err` schedules a retry with backoff.
#[async_trait]
pub trait Handler<T: Resource>: Send + Sync {
    async fn on_create(
        &self,
        notification: &ChangeNotification,
        object: &T,
    ) -> Result<(), HandlerError>;

    async fn on_update(
        &self,
        notification: &ChangeNotification,
        object: &T,
    ) -> Result<(), HandlerError>;

    /// `object` is the last known state, or `None` if it was never observed
    /// or is no longer retained; only the key is guaranteed.
    async fn on_delete(
        &self,
        notification: &ChangeNotification,
        object: Option<&T>,
    ) -> Result<(), HandlerError>;
}

/// A key the engine stopped retrying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub kind: KindTag,
    pub key: ObjectKey,
    pub change: ChangeKind,
    pub attempts: u32,
    pub error: String,
}

/// Receives give-up reports. Must not block.
pub trait ErrorSink: Send + Sync {
    fn report(&self, report: FailureReport);
}

/// Logs each report at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, report: FailureReport) {
        tracing::error!(
            kind = %report.kind,
            key = %report.key,
            change = %report.change,
            attempts = report.attempts,
            error = %report.error,
            "giving up on object after repeated failures",
        );
    }
}

/// Forwards each report into a channel.
#[derive(Debug, Clone)]
pub struct ChannelErrorSink {
    tx: mpsc::UnboundedSender<FailureReport>,
}

impl ChannelErrorSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FailureReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ErrorSink for ChannelErrorSink {
    fn report(&self, report: FailureReport) {
        if let Err(err) = self.tx.send(report) {
            tracing::warn!(key = %err.0.key, "error sink receiver dropped; report lost");
        }
    }
}
