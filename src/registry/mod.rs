// Concurrent registry module for the SFU
//
// This module provides the keyed storage primitive used by sessions, workers
// and connection registries: a thread-safe map with a counted size,
// snapshot/drain and iteration.

use std::{
    borrow::Borrow,
    collections::HashMap,
    hash::Hash,
    sync::atomic::{AtomicUsize, Ordering},
};

use dashmap::DashMap;

/// Thread-safe map with a counted size
///
/// Values are handed out by clone, so callers usually store `Arc`s. No
/// internal guard ever escapes a method, which keeps the registry safe to use
/// from async code that awaits between calls.
pub struct ConcurrentRegistry<K, V>
where
    K: Eq + Hash,
{
    /// Stored entries
    items: DashMap<K, V>,
    /// Number of live entries
    count: AtomicUsize,
}

impl<K, V> ConcurrentRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            count: AtomicUsize::new(0),
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether the registry holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a value, returning the previous one
    pub fn set(&self, key: K, value: V) -> Option<V> {
        let previous = self.items.insert(key, value);
        if previous.is_none() {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        previous
    }

    /// Get a clone of the value stored under `key`
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.items.get(key).map(|entry| entry.value().clone())
    }

    /// Whether `key` is present
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.items.contains_key(key)
    }

    /// Remove the value stored under `key`
    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = self.items.remove(key).map(|(_, value)| value);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Remove the value under `key` only if `predicate` holds for it
    pub fn delete_if<Q>(&self, key: &Q, predicate: impl FnOnce(&V) -> bool) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = self
            .items
            .remove_if(key, |_, value| predicate(value))
            .map(|(_, value)| value);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Snapshot of the current keys
    pub fn keys(&self) -> Vec<K> {
        self.items.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Snapshot of the current values
    pub fn values(&self) -> Vec<V> {
        self.items.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Visit entries until `visit` returns false
    ///
    /// The visitor runs while a shard guard is held; it must not call back
    /// into this registry.
    pub fn iter(&self, mut visit: impl FnMut(&K, &V) -> bool) {
        for entry in self.items.iter() {
            if !visit(entry.key(), entry.value()) {
                break;
            }
        }
    }

    /// Snapshot of the whole map
    pub fn to_map(&self) -> HashMap<K, V> {
        self.items
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Snapshot and drain
    ///
    /// Entries inserted after the snapshot was taken survive the drain.
    pub fn capture(&self) -> HashMap<K, V> {
        let mut captured = HashMap::new();
        for key in self.keys() {
            if let Some(value) = self.delete(&key) {
                captured.insert(key, value);
            }
        }
        captured
    }
}

// Default implementation
impl<K, V> Default for ConcurrentRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
