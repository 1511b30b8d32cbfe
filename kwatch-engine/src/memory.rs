//! In-process source adapter.
//!
//! Holds an authoritative object set plus a revisioned change log. Snapshots
//! read the set; streams replay the log after the requested position and then
//! follow live changes. Used for fixture replay and tests, where it can also
//! drop streams and fail snapshots on demand.
//!
//! The change log is never compacted.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use kwatch_core::{ChangeKind, KindTag, ObjectKey, Resource};

use crate::error::SourceError;
use crate::source::{EventStream, ListOptions, Position, Snapshot, SourceAdapter, WatchEvent};

/// Live events buffered per stream beyond any replayed backlog. A stream
/// that falls this far behind is dropped and has to relist.
pub const STREAM_CAPACITY: usize = 1024;

struct Subscriber<T> {
    options: ListOptions,
    tx: mpsc::Sender<Result<WatchEvent<T>, SourceError>>,
}

struct MemoryState<T> {
    objects: BTreeMap<ObjectKey, T>,
    log: Vec<(u64, WatchEvent<T>)>,
    revision: u64,
    subscribers: Vec<Subscriber<T>>,
    failing_snapshots: u32,
    failing_streams: u32,
    snapshot_calls: u32,
    stream_calls: u32,
}

pub struct MemorySource<T> {
    state: Mutex<MemoryState<T>>,
}

impl<T: Resource> Default for MemorySource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Resource> MemorySource<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                objects: BTreeMap::new(),
                log: Vec::new(),
                revision: 0,
                subscribers: Vec::new(),
                failing_snapshots: 0,
                failing_streams: 0,
                snapshot_calls: 0,
                stream_calls: 0,
            }),
        }
    }

    /// A source whose store already holds `objects`, with no change history.
    pub fn with_objects(objects: impl IntoIterator<Item = T>) -> Self {
        let source = Self::new();
        for object in objects {
            source.seed(object);
        }
        source
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put an object in the store without emitting a change.
    pub fn seed(&self, object: T) {
        self.lock().objects.insert(object.key(), object);
    }

    /// Record a change, update the store, and push it to open streams.
    pub fn emit(&self, change: ChangeKind, object: T) {
        let mut state = self.lock();
        state.revision += 1;
        let revision = state.revision;
        match change {
            ChangeKind::Created | ChangeKind::Updated => {
                state.objects.insert(object.key(), object.clone());
            }
            ChangeKind::Deleted => {
                state.objects.remove(&object.key());
            }
        }
        let event = WatchEvent::new(change, object);
        state.subscribers.retain(|sub| {
            if !sub.options.matches(&event.object) {
                return !sub.tx.is_closed();
            }
            sub.tx.try_send(Ok(event.clone())).is_ok()
        });
        state.log.push((revision, event));
    }

    pub fn create(&self, object: T) {
        self.emit(ChangeKind::Created, object);
    }

    pub fn update(&self, object: T) {
        self.emit(ChangeKind::Updated, object);
    }

    pub fn delete(&self, object: T) {
        self.emit(ChangeKind::Deleted, object);
    }

    /// Close every open stream, as if the remote end hung up.
    pub fn disconnect(&self) {
        self.lock().subscribers.clear();
    }

    /// Deliver a stream error to every open stream, then close them.
    pub fn break_streams(&self, message: &str) {
        let mut state = self.lock();
        for sub in state.subscribers.drain(..) {
            let _ = sub.tx.try_send(Err(SourceError::Stream(message.to_owned())));
        }
    }

    /// Make the next `count` snapshot calls fail.
    pub fn fail_snapshots(&self, count: u32) {
        self.lock().failing_snapshots = count;
    }

    /// Make the next `count` stream calls fail.
    pub fn fail_streams(&self, count: u32) {
        self.lock().failing_streams = count;
    }

    pub fn snapshot_calls(&self) -> u32 {
        self.lock().snapshot_calls
    }

    pub fn stream_calls(&self) -> u32 {
        self.lock().stream_calls
    }

    pub fn open_streams(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state.subscribers.len()
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }
}

#[async_trait]
impl<T: Resource> SourceAdapter<T> for MemorySource<T> {
    async fn snapshot(
        &self,
        kind: &KindTag,
        options: &ListOptions,
    ) -> Result<Snapshot<T>, SourceError> {
        let mut state = self.lock();
        state.snapshot_calls += 1;
        if state.failing_snapshots > 0 {
            state.failing_snapshots -= 1;
            return Err(SourceError::Snapshot(format!(
                "{kind}: injected snapshot failure"
            )));
        }
        let objects = state
            .objects
            .values()
            .filter(|object| options.matches(*object))
            .cloned()
            .collect();
        Ok(Snapshot {
            objects,
            position: Position(state.revision.to_string()),
        })
    }

    async fn stream(
        &self,
        kind: &KindTag,
        position: &Position,
        options: &ListOptions,
    ) -> Result<EventStream<T>, SourceError> {
        let mut state = self.lock();
        state.stream_calls += 1;
        if state.failing_streams > 0 {
            state.failing_streams -= 1;
            return Err(SourceError::Stream(format!("{kind}: injected stream failure")));
        }
        let after: u64 = position
            .0
            .parse()
            .map_err(|_| SourceError::Stream(format!("{kind}: invalid position '{position}'")))?;

        let backlog: Vec<WatchEvent<T>> = state
            .log
            .iter()
            .filter(|(revision, event)| *revision > after && options.matches(&event.object))
            .map(|(_, event)| event.clone())
            .collect();

        let (tx, rx) = mpsc::channel(backlog.len() + STREAM_CAPACITY);
        for event in backlog {
            // Capacity covers the whole backlog.
            let _ = tx.try_send(Ok(event));
        }
        state.subscribers.push(Subscriber {
            options: options.clone(),
            tx,
        });
        Ok(rx)
    }
}
