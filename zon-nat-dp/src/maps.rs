use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    hash::Hash,
    sync::atomic::{AtomicUsize, Ordering},
};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    #[error("map {name} is full, max entries: {max}")]
    Full { name: &'static str, max: usize },
}

/// Hash map with a fixed number of keys whose values are only ever
/// replaced whole. Readers get a copy of the value, never a reference
/// into the map, so they observe either the previous or the next value.
pub struct BoundedHashMap<K, V> {
    name: &'static str,
    max_entries: usize,
    // Kept apart from the shards, `DashMap::len` locks every shard
    len: AtomicUsize,
    inner: DashMap<K, V>,
}

impl<K, V> BoundedHashMap<K, V>
where
    K: Eq + Hash + Copy,
    V: Copy,
{
    pub fn with_max_entries(name: &'static str, max_entries: usize) -> Self {
        Self {
            name,
            max_entries,
            len: AtomicUsize::new(0),
            inner: DashMap::with_capacity(max_entries),
        }
    }

    /// Takes one key slot, called with the shard of the new key locked.
    fn reserve(&self) -> Result<(), MapError> {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_entries).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| self.full())
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|v| *v)
    }

    pub fn insert(&self, key: K, value: V) -> Result<(), MapError> {
        self.update(key, |_| value).map(|_| ())
    }

    /// Replaces the value of `key` with the one computed from the current
    /// value while the key is locked. Returns the stored value.
    pub fn update<F>(&self, key: K, f: F) -> Result<V, MapError>
    where
        F: FnOnce(Option<V>) -> V,
    {
        match self.inner.entry(key) {
            Entry::Occupied(mut entry) => {
                let value = f(Some(*entry.get()));
                entry.insert(value);
                Ok(value)
            }
            Entry::Vacant(entry) => {
                self.reserve()?;
                let value = f(None);
                entry.insert(value);
                Ok(value)
            }
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let (_, value) = self.inner.remove(key)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn full(&self) -> MapError {
        MapError::Full {
            name: self.name,
            max: self.max_entries,
        }
    }
}
