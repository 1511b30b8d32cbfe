//! Which change to deliver for each queued key.
//!
//! The work queue only carries keys, so several notifications for one key
//! collapse into a single delivery. The ledger folds their change kinds
//! together so the worker knows what the collapsed delivery means.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use kwatch_core::{ChangeKind, ObjectKey};

/// The folded change pending for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingChange {
    pub kind: ChangeKind,
    /// The object was created and then modified before the creation was
    /// delivered. If the creation turns out to be a startup replay, the
    /// modification still has to be delivered as an update.
    pub updated_after_create: bool,
}

impl PendingChange {
    pub fn new(kind: ChangeKind) -> Self {
        Self {
            kind,
            updated_after_create: false,
        }
    }

    pub fn merge(self, newer: PendingChange) -> PendingChange {
        let kind = self.kind.merge(newer.kind);
        let updated_after_create = kind == ChangeKind::Created
            && (self.updated_after_create
                || newer.updated_after_create
                || (self.kind == ChangeKind::Created && newer.kind == ChangeKind::Updated));
        PendingChange {
            kind,
            updated_after_create,
        }
    }
}

#[derive(Default)]
pub struct ChangeLedger {
    entries: Mutex<HashMap<ObjectKey, PendingChange>>,
}

impl ChangeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectKey, PendingChange>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold a newly observed change into whatever is pending for `key`.
    pub fn record(&self, key: ObjectKey, kind: ChangeKind) {
        let mut entries = self.lock();
        let next = PendingChange::new(kind);
        let merged = match entries.get(&key) {
            Some(pending) => pending.merge(next),
            None => next,
        };
        entries.insert(key, merged);
    }

    /// Claim the pending change for `key` at the start of processing.
    pub fn take(&self, key: &ObjectKey) -> Option<PendingChange> {
        self.lock().remove(key)
    }

    /// Put back a change whose delivery failed, underneath anything that
    /// was recorded while it was being processed.
    pub fn restore(&self, key: ObjectKey, change: PendingChange) {
        let mut entries = self.lock();
        let merged = match entries.get(&key) {
            Some(newer) => change.merge(*newer),
            None => change,
        };
        entries.insert(key, merged);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
