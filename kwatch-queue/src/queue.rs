//! Coalescing work queue with delayed visibility.
//!
//! Invariants, all guarded by one mutex:
//! - a key is in `ready` at most once
//! - a key in `processing` is never also in `ready`; re-adds while processing
//!   only mark it `dirty`, and `done` moves a dirty key back to `ready`
//! - `waiting` holds keys scheduled by `add_after`; they join `ready` when a
//!   `get` observes their deadline has passed

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

struct QueueState<K> {
    ready: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: BTreeMap<(Instant, u64), K>,
    waiting_at: HashMap<K, (Instant, u64)>,
    next_seq: u64,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> QueueState<K> {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            waiting: BTreeMap::new(),
            waiting_at: HashMap::new(),
            next_seq: 0,
            shutting_down: false,
        }
    }

    /// Returns true when the key was appended to `ready`.
    fn insert(&mut self, key: K) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.ready.push_back(key);
        true
    }

    fn schedule(&mut self, key: K, ready_at: Instant) {
        if let Some(existing) = self.waiting_at.get(&key) {
            if existing.0 <= ready_at {
                return;
            }
            let existing = *existing;
            self.waiting.remove(&existing);
        }
        let slot = (ready_at, self.next_seq);
        self.next_seq = self.next_seq.wrapping_add(1);
        self.waiting.insert(slot, key.clone());
        self.waiting_at.insert(key, slot);
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.waiting.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            self.waiting_at.remove(&key);
            self.insert(key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.keys().next().map(|(at, _)| *at)
    }
}

/// A FIFO queue of distinct keys shared between producers and workers.
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K: Clone + Eq + Hash> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `key` unless it is already queued. A key that is currently being
    /// processed is marked dirty and re-queued by [`done`](Self::done).
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if state.insert(key) {
            self.notify.notify_one();
        }
    }

    /// Make `key` visible to [`get`](Self::get) once `delay` has elapsed. If
    /// the key is already waiting, the earlier deadline wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        state.schedule(key, Instant::now() + delay);
        // Sleeping workers may be waiting on a later deadline.
        self.notify.notify_waiters();
    }

    /// Wait for the next key and mark it as processing.
    ///
    /// Returns `None` once the queue is shut down and nothing is left in the
    /// ready set.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                state.promote_due(Instant::now());
                if let Some(key) = state.ready.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark `key` as no longer processing, re-queueing it if it was added
    /// again in the meantime.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.ready.push_back(key.clone());
            self.notify.notify_one();
        }
    }

    /// Stop accepting new keys. Workers drain whatever is ready, then `get`
    /// returns `None`. Keys still waiting on a delay are dropped.
    pub fn shut_down(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.waiting.clear();
        state.waiting_at.clear();
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys scheduled by `add_after` that are not yet visible.
    pub fn waiting_len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_processing(&self, key: &K) -> bool {
        self.lock().processing.contains(key)
    }

    /// Whether `key` has a delivery pending (queued, or dirty while processing).
    pub fn is_pending(&self, key: &K) -> bool {
        self.lock().dirty.contains(key)
    }
}
