//! Thread-safe last-known state for one object kind.
//!
//! Live entries are keyed by [`ObjectKey`]. Deleted objects move to a
//! tombstone map so the delete handler can still see their final metadata;
//! the reconcile loop purges tombstones once the delete has been delivered.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kwatch_core::{ChangeKind, ChangeNotification, KindTag, ObjectKey, Resource};

/// One difference found when installing a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub key: ObjectKey,
    pub kind: ChangeKind,
}

struct IndexerState<T> {
    live: HashMap<ObjectKey, Arc<T>>,
    tombstones: HashMap<ObjectKey, Arc<T>>,
    synced: bool,
}

pub struct Indexer<T> {
    kind: KindTag,
    state: RwLock<IndexerState<T>>,
}

impl<T: Resource> Indexer<T> {
    pub fn new(kind: KindTag) -> Self {
        Self {
            kind,
            state: RwLock::new(IndexerState {
                live: HashMap::new(),
                tombstones: HashMap::new(),
                synced: false,
            }),
        }
    }

    pub fn kind(&self) -> &KindTag {
        &self.kind
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexerState<T>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexerState<T>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a full snapshot and return what changed relative to the
    /// current contents. Objects whose resource version is unchanged produce
    /// no delta, so replaying an identical snapshot is a no-op.
    pub fn replace(&self, objects: Vec<T>) -> Vec<Delta> {
        let mut state = self.write();
        let mut incoming: HashMap<ObjectKey, Arc<T>> = HashMap::with_capacity(objects.len());
        for object in objects {
            incoming.insert(object.key(), Arc::new(object));
        }

        let mut deltas = Vec::new();
        for (key, object) in &incoming {
            match state.live.get(key) {
                None => deltas.push(Delta {
                    key: key.clone(),
                    kind: ChangeKind::Created,
                }),
                Some(current) if current.resource_version() != object.resource_version() => {
                    deltas.push(Delta {
                        key: key.clone(),
                        kind: ChangeKind::Updated,
                    })
                }
                Some(_) => {}
            }
        }

        let gone: Vec<ObjectKey> = state
            .live
            .keys()
            .filter(|key| !incoming.contains_key(*key))
            .cloned()
            .collect();
        for key in gone {
            if let Some(last) = state.live.remove(&key) {
                state.tombstones.insert(key.clone(), last);
            }
            deltas.push(Delta {
                key,
                kind: ChangeKind::Deleted,
            });
        }

        for key in incoming.keys() {
            state.tombstones.remove(key);
        }
        state.live = incoming;
        state.synced = true;

        deltas.sort_by(|a, b| a.key.cmp(&b.key));
        deltas
    }

    /// Apply one streamed change. Returns `false` when the change carries
    /// nothing new (a repeated revision, or a delete of an object already
    /// gone).
    pub fn apply(&self, notification: &ChangeNotification, object: T) -> bool {
        let mut state = self.write();
        let key = &notification.key;
        match notification.kind {
            ChangeKind::Created | ChangeKind::Updated => {
                if let Some(current) = state.live.get(key) {
                    if current.resource_version() == object.resource_version() {
                        return false;
                    }
                }
                state.tombstones.remove(key);
                state.live.insert(key.clone(), Arc::new(object));
                true
            }
            ChangeKind::Deleted => match state.live.remove(key) {
                Some(_) => {
                    // The delete event carries the final state; prefer it.
                    state.tombstones.insert(key.clone(), Arc::new(object));
                    true
                }
                None if state.tombstones.contains_key(key) => false,
                None => {
                    state.tombstones.insert(key.clone(), Arc::new(object));
                    true
                }
            },
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<T>> {
        self.read().live.get(key).cloned()
    }

    /// Final known state of a deleted object, if it is still retained.
    pub fn tombstone(&self, key: &ObjectKey) -> Option<Arc<T>> {
        self.read().tombstones.get(key).cloned()
    }

    pub fn purge_tombstone(&self, key: &ObjectKey) {
        self.write().tombstones.remove(key);
    }

    /// True once the first snapshot has been installed.
    pub fn has_synced(&self) -> bool {
        self.read().synced
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self.read().live.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.read().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstone_count(&self) -> usize {
        self.read().tombstones.len()
    }
}

#[cfg(test)]
mod tests {
    use kwatch_core::GenericObject;

    use super::*;

    fn obj(ns: &str, name: &str, rv: &str) -> GenericObject {
        GenericObject::new(Some(ns), name, rv)
    }

    fn note(key: &str, kind: ChangeKind) -> ChangeNotification {
        ChangeNotification::new(key.parse().expect("key"), kind, KindTag::from("pod"))
    }

    fn indexer() -> Indexer<GenericObject> {
        Indexer::new(KindTag::from("pod"))
    }

    #[test]
    fn first_replace_marks_synced_and_reports_creates() {
        let cache = indexer();
        assert!(!cache.has_synced());

        let deltas = cache.replace(vec![obj("ns", "b", "1"), obj("ns", "a", "1")]);
        assert!(cache.has_synced());
        assert_eq!(
            deltas,
            vec![
                Delta {
                    key: ObjectKey::namespaced("ns", "a"),
                    kind: ChangeKind::Created
                },
                Delta {
                    key: ObjectKey::namespaced("ns", "b"),
                    kind: ChangeKind::Created
                },
            ]
        );
        assert_eq!(cache.keys().len(), 2);
    }

    #[test]
    fn identical_replace_produces_no_deltas() {
        let cache = indexer();
        cache.replace(vec![obj("ns", "a", "1"), obj("ns", "b", "4")]);
        let deltas = cache.replace(vec![obj("ns", "a", "1"), obj("ns", "b", "4")]);
        assert!(deltas.is_empty(), "got {deltas:?}");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn replace_diffs_updates_and_deletions() {
        let cache = indexer();
        cache.replace(vec![obj("ns", "keep", "1"), obj("ns", "bump", "1"), obj("ns", "gone", "1")]);
        let deltas = cache.replace(vec![
            obj("ns", "keep", "1"),
            obj("ns", "bump", "2"),
            obj("ns", "new", "1"),
        ]);

        let kinds: Vec<(String, ChangeKind)> = deltas
            .into_iter()
            .map(|d| (d.key.to_string(), d.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("ns/bump".to_string(), ChangeKind::Updated),
                ("ns/gone".to_string(), ChangeKind::Deleted),
                ("ns/new".to_string(), ChangeKind::Created),
            ]
        );
        let gone = ObjectKey::namespaced("ns", "gone");
        assert!(cache.get(&gone).is_none());
        assert_eq!(cache.tombstone(&gone).expect("tombstone").resource_version, "1");
    }

    #[test]
    fn reads_observe_latest_apply() {
        let cache = indexer();
        cache.replace(vec![obj("ns", "a", "1")]);
        for rv in ["2", "3", "4"] {
            assert!(cache.apply(&note("ns/a", ChangeKind::Updated), obj("ns", "a", rv)));
        }
        let key = ObjectKey::namespaced("ns", "a");
        assert_eq!(cache.get(&key).expect("entry").resource_version, "4");
    }

    #[test]
    fn repeated_revision_is_not_a_change() {
        let cache = indexer();
        assert!(cache.apply(&note("ns/a", ChangeKind::Created), obj("ns", "a", "1")));
        assert!(!cache.apply(&note("ns/a", ChangeKind::Updated), obj("ns", "a", "1")));
    }

    #[test]
    fn delete_moves_entry_to_tombstone() {
        let cache = indexer();
        cache.replace(vec![obj("ns", "b", "1")]);
        assert!(cache.apply(&note("ns/b", ChangeKind::Deleted), obj("ns", "b", "2")));

        let key = ObjectKey::namespaced("ns", "b");
        assert!(cache.get(&key).is_none());
        assert!(!cache.keys().contains(&key));
        assert_eq!(cache.tombstone(&key).expect("tombstone").resource_version, "2");

        assert!(
            !cache.apply(&note("ns/b", ChangeKind::Deleted), obj("ns", "b", "2")),
            "second delete is a duplicate"
        );

        cache.purge_tombstone(&key);
        assert!(cache.tombstone(&key).is_none());
    }

    #[test]
    fn recreate_clears_tombstone() {
        let cache = indexer();
        cache.apply(&note("ns/c", ChangeKind::Created), obj("ns", "c", "1"));
        cache.apply(&note("ns/c", ChangeKind::Deleted), obj("ns", "c", "1"));
        assert_eq!(cache.tombstone_count(), 1);

        cache.apply(&note("ns/c", ChangeKind::Created), obj("ns", "c", "5"));
        assert_eq!(cache.tombstone_count(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let cache = Arc::new(indexer());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let name = format!("w{w}-{i}");
                        cache.apply(
                            &note(&format!("ns/{name}"), ChangeKind::Created),
                            obj("ns", &name, "1"),
                        );
                        assert!(cache.get(&ObjectKey::namespaced("ns", &name)).is_some());
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread");
        }
        assert_eq!(cache.len(), 400);
    }
}
