use thiserror::Error;

use kwatch_core::{ChangeKind, ConfigError, KindTag};

/// Failures reported by a source adapter.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("snapshot failed: {0}")]
    Snapshot(String),

    #[error("change stream failed: {0}")]
    Stream(String),
}

/// Failure returned by a handler callback.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Why a single reconcile step failed.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{change} handler failed: {source}")]
    Handler {
        change: ChangeKind,
        #[source]
        source: HandlerError,
    },

    #[error("no handler registered for kind '{kind}'")]
    MissingHandler { kind: KindTag, change: ChangeKind },
}

impl ReconcileError {
    /// Only handler failures are worth another attempt; a missing handler
    /// will still be missing after any backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Handler { .. })
    }

    /// The change that was being delivered.
    pub fn change(&self) -> ChangeKind {
        match self {
            ReconcileError::Handler { change, .. } | ReconcileError::MissingHandler { change, .. } => {
                *change
            }
        }
    }
}

/// Error surface for the engine runtime.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("source for kind '{kind}' unavailable after {failures} consecutive failures: {source}")]
    SourceUnavailable {
        kind: KindTag,
        failures: u32,
        #[source]
        source: SourceError,
    },

    #[error("kind '{0}' is bound more than once")]
    DuplicateBinding(KindTag),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{task} task join failure: {message}")]
    Join { task: String, message: String },
}
