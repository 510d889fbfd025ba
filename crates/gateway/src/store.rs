//! Keyed state storage shared by the quota tracker and circuit breakers.
//!
//! Every read-check-write sequence runs inside `with_entry`, which holds an
//! exclusive lock on that key for the duration of the closure. Two requests
//! from the same identity can therefore never both observe room under a
//! ceiling and both be admitted past it.

use dashmap::DashMap;
use std::hash::Hash;

pub trait StateStore<K, V>: Send + Sync {
    /// Run `f` with exclusive access to the entry for `key`, creating it
    /// with `init` first when absent.
    fn with_entry<R>(&self, key: &K, init: impl FnOnce() -> V, f: impl FnOnce(&mut V) -> R) -> R;

    /// Copy of the current entry, if any
    fn get(&self, key: &K) -> Option<V>;

    /// Keep only entries for which `keep` returns true; returns how many
    /// were dropped.
    fn retain(&self, keep: impl FnMut(&K, &V) -> bool) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process store backed by a sharded `DashMap`
#[derive(Debug)]
pub struct DashMapStore<K: Eq + Hash, V> {
    map: DashMap<K, V>,
}

impl<K: Eq + Hash, V> DashMapStore<K, V> {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }
}

impl<K: Eq + Hash, V> Default for DashMapStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> StateStore<K, V> for DashMapStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn with_entry<R>(&self, key: &K, init: impl FnOnce() -> V, f: impl FnOnce(&mut V) -> R) -> R {
        let mut entry = self.map.entry(key.clone()).or_insert_with(init);
        f(entry.value_mut())
    }

    fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        let before = self.map.len();
        self.map.retain(|k, v| keep(k, &*v));
        before.saturating_sub(self.map.len())
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}
