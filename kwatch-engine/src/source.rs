//! Boundary to the remote object store.
//!
//! The engine does not talk to any API server itself. A [`SourceAdapter`]
//! supplies a point-in-time snapshot of one kind plus an open-ended stream of
//! changes after that snapshot's position. When the stream ends, for any
//! reason, the engine takes a fresh snapshot and opens a new stream.

use async_trait::async_trait;
use tokio::sync::mpsc;

use kwatch_core::{ChangeKind, ChangeNotification, KindTag, Resource};

use crate::error::SourceError;

/// Opaque marker of where a snapshot was taken; streams resume after it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Position(pub String);

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Scope applied to both snapshots and streams.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListOptions {
    pub namespace: Option<String>,
}

impl ListOptions {
    pub fn matches<T: Resource>(&self, object: &T) -> bool {
        match &self.namespace {
            Some(ns) => object.namespace() == Some(ns.as_str()),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    pub objects: Vec<T>,
    pub position: Position,
}

/// One change as delivered by the stream, carrying the object's new state
/// (or final state, for deletions).
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent<T> {
    pub change: ChangeKind,
    pub object: T,
}

impl<T: Resource> WatchEvent<T> {
    pub fn new(change: ChangeKind, object: T) -> Self {
        Self { change, object }
    }

    pub fn notification(&self, kind: &KindTag) -> ChangeNotification {
        ChangeNotification::new(self.object.key(), self.change, kind.clone())
    }
}

/// A change stream. A closed channel means the remote end went away; an
/// `Err` item means the stream broke. Either way the engine relists.
pub type EventStream<T> = mpsc::Receiver<Result<WatchEvent<T>, SourceError>>;

#[async_trait]
pub trait SourceAdapter<T: Resource>: Send + Sync {
    async fn snapshot(
        &self,
        kind: &KindTag,
        options: &ListOptions,
    ) -> Result<Snapshot<T>, SourceError>;

    async fn stream(
        &self,
        kind: &KindTag,
        position: &Position,
        options: &ListOptions,
    ) -> Result<EventStream<T>, SourceError>;
}
