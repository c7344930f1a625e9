//! Skiff store: the local cache of watched resources.
//!
//! The cache is split in two halves. A single [`CacheWriter`] belongs to the watcher and is the
//! only way to change contents; any number of [`CacheReader`]s serve point lookups to workers and
//! frozen [`CacheView`]s to whatever renders state.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use arc_swap::ArcSwap;
use metrics::gauge;
use rustc_hash::FxHashMap;
use skiff_core::{ResourceKey, ResourceSnapshot};
use tokio::sync::watch;
use tracing::debug;

type Entry<K> = Arc<ResourceSnapshot<K>>;

struct Inner<K> {
    items: FxHashMap<ResourceKey, Entry<K>>,
    epoch: u64,
}

struct Shared<K> {
    inner: RwLock<Inner<K>>,
    view: ArcSwap<CacheView<K>>,
    epoch_tx: watch::Sender<u64>,
}

impl<K> Shared<K> {
    fn read(&self) -> RwLockReadGuard<'_, Inner<K>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<K>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bump the epoch and publish it; caller holds the write lock.
fn bump<K>(shared: &Shared<K>, inner: &mut Inner<K>) {
    inner.epoch = inner.epoch.saturating_add(1);
    shared.epoch_tx.send_replace(inner.epoch);
    gauge!("skiff_cache_objects", inner.items.len() as f64);
}

/// Create an empty cache, returning its only writer and a first reader.
pub fn local_cache<K>() -> (CacheWriter<K>, CacheReader<K>) {
    let (epoch_tx, _) = watch::channel(0u64);
    let shared = Arc::new(Shared {
        inner: RwLock::new(Inner { items: FxHashMap::default(), epoch: 0 }),
        view: ArcSwap::from_pointee(CacheView::default()),
        epoch_tx,
    });
    (CacheWriter { shared: Arc::clone(&shared) }, CacheReader { shared })
}

/// Exclusive write half of the cache. Deliberately not `Clone`.
pub struct CacheWriter<K> {
    shared: Arc<Shared<K>>,
}

/// What a full replacement changed, in listing order.
pub struct ReplaceOutcome<K> {
    pub added: Vec<Entry<K>>,
    pub updated: Vec<Entry<K>>,
    pub removed: Vec<ResourceKey>,
}

impl<K> CacheWriter<K> {
    pub fn reader(&self) -> CacheReader<K> { CacheReader { shared: Arc::clone(&self.shared) } }

    /// Insert or supersede the snapshot for its key. Returns the previous snapshot, if any.
    pub fn upsert(&self, snapshot: Entry<K>) -> Option<Entry<K>> {
        let mut inner = self.shared.write();
        let prev = inner.items.insert(snapshot.key.clone(), snapshot);
        bump(&self.shared, &mut inner);
        prev
    }

    /// Drop the snapshot for `key`. Removing an unknown key still counts as a write.
    pub fn remove(&self, key: &ResourceKey) -> Option<Entry<K>> {
        let mut inner = self.shared.write();
        let prev = inner.items.remove(key);
        bump(&self.shared, &mut inner);
        prev
    }

    /// Swap the whole contents for `items` in one step (relist).
    ///
    /// Readers observe either the old contents or the new ones, never a mix. When a key is listed
    /// more than once, the last occurrence wins.
    pub fn replace(&self, items: Vec<Entry<K>>) -> ReplaceOutcome<K> {
        let mut next: FxHashMap<ResourceKey, Entry<K>> = FxHashMap::default();
        next.reserve(items.len());
        for snap in &items {
            next.insert(snap.key.clone(), Arc::clone(snap));
        }

        let mut inner = self.shared.write();
        let mut out = ReplaceOutcome { added: Vec::new(), updated: Vec::new(), removed: Vec::new() };
        for snap in items {
            let is_last = next.get(&snap.key).map(|s| Arc::ptr_eq(s, &snap)).unwrap_or(false);
            if !is_last {
                continue;
            }
            if inner.items.contains_key(&snap.key) {
                out.updated.push(snap);
            } else {
                out.added.push(snap);
            }
        }
        out.removed = inner.items.keys().filter(|k| !next.contains_key(*k)).cloned().collect();
        out.removed.sort_unstable();
        inner.items = next;
        bump(&self.shared, &mut inner);
        debug!(added = out.added.len(), updated = out.updated.len(), removed = out.removed.len(), epoch = inner.epoch, "cache replaced");
        out
    }
}

/// Read-only half of the cache.
pub struct CacheReader<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for CacheReader<K> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<K> CacheReader<K> {
    pub fn get(&self, key: &ResourceKey) -> Option<Entry<K>> { self.shared.read().items.get(key).cloned() }
    pub fn contains_key(&self, key: &ResourceKey) -> bool { self.shared.read().items.contains_key(key) }
    pub fn len(&self) -> usize { self.shared.read().items.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn epoch(&self) -> u64 { self.shared.read().epoch }

    /// Point-in-time copy of the whole cache. Rebuilt only when a write happened since the
    /// last call; otherwise the previous view is handed out again.
    pub fn view(&self) -> Arc<CacheView<K>> {
        let current = self.shared.view.load_full();
        let inner = self.shared.read();
        if current.epoch == inner.epoch {
            return current;
        }
        let next = Arc::new(CacheView {
            epoch: inner.epoch,
            items: inner.items.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect(),
        });
        drop(inner);
        self.shared.view.store(Arc::clone(&next));
        next
    }

    /// Receive the cache epoch after every write.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.shared.epoch_tx.subscribe() }
}

/// Frozen, key-sorted copy of the cache at one epoch.
pub struct CacheView<K> {
    pub epoch: u64,
    pub items: BTreeMap<ResourceKey, Entry<K>>,
}

impl<K> Default for CacheView<K> {
    fn default() -> Self { Self { epoch: 0, items: BTreeMap::new() } }
}

impl<K> CacheView<K> {
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn get(&self, key: &ResourceKey) -> Option<&Entry<K>> { self.items.get(key) }
    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> { self.items.keys() }
    pub fn iter(&self) -> impl Iterator<Item = (&ResourceKey, &Entry<K>)> { self.items.iter() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(key: &str, v: u32) -> Entry<u32> {
        Arc::new(ResourceSnapshot::new(key.parse().unwrap(), v))
    }

    #[test]
    fn upsert_returns_previous() {
        let (w, r) = local_cache();
        assert!(w.upsert(snap("ns/a", 1)).is_none());
        let prev = w.upsert(snap("ns/a", 2)).unwrap();
        assert_eq!(prev.object, 1);
        assert_eq!(r.get(&"ns/a".parse().unwrap()).unwrap().object, 2);
        assert_eq!(r.epoch(), 2);
    }

    #[test]
    fn view_is_reused_until_next_write() {
        let (w, r) = local_cache();
        w.upsert(snap("ns/a", 1));
        let v1 = r.view();
        let v2 = r.view();
        assert!(Arc::ptr_eq(&v1, &v2));
        w.upsert(snap("ns/b", 1));
        let v3 = r.view();
        assert!(!Arc::ptr_eq(&v1, &v3));
        // the older view is frozen
        assert_eq!(v1.len(), 1);
        assert_eq!(v3.len(), 2);
    }

    #[test]
    fn replace_classifies_and_dedups() {
        let (w, r) = local_cache();
        w.upsert(snap("ns/a", 1));
        w.upsert(snap("ns/gone", 1));
        let out = w.replace(vec![snap("ns/a", 2), snap("ns/b", 1), snap("ns/b", 3)]);
        let added: Vec<_> = out.added.iter().map(|s| (s.key.to_string(), s.object)).collect();
        let updated: Vec<_> = out.updated.iter().map(|s| s.key.to_string()).collect();
        assert_eq!(added, vec![("ns/b".to_string(), 3)]);
        assert_eq!(updated, vec!["ns/a".to_string()]);
        assert_eq!(out.removed, vec!["ns/gone".parse::<ResourceKey>().unwrap()]);
        assert_eq!(r.len(), 2);
        assert!(!r.contains_key(&"ns/gone".parse().unwrap()));
    }
}
