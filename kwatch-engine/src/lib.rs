//! Watch-and-reconcile engine: informer + indexer + rate-limited queue +
//! reconcile workers, one independent set per observed object kind.

pub mod cache;
mod error;
pub mod handler;
mod informer;
pub mod ledger;
pub mod memory;
pub mod reconcile;
mod runtime;
pub mod source;

pub use cache::{Delta, Indexer};
pub use error::{EngineError, HandlerError, ReconcileError, SourceError};
pub use handler::{ChannelErrorSink, ErrorSink, FailureReport, Handler, TracingErrorSink};
pub use ledger::{ChangeLedger, PendingChange};
pub use memory::MemorySource;
pub use reconcile::{Outcome, ReconcileStats, Reconciler};
pub use runtime::{
    init_tracing, Engine, EngineBuilder, KindBinding, KindOutcome, KindStatus, LogFormat,
    RunSummary, RunningEngine, ShutdownHandle,
};
pub use source::{EventStream, ListOptions, Position, Snapshot, SourceAdapter, WatchEvent};
