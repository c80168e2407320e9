//! Sharded concurrent map for per-session registries
//!
//! Session-keyed state (cache slots, stored criteria) lives in a
//! [`ShardedMap`]: a fixed array of `RwLock<HashMap<K, V>>` shards selected
//! by key hash. Two sessions only contend when they hash to the same shard,
//! and even then only for the duration of a map operation; no lock is ever
//! held across an `.await`.
//!
//! Poisoned shard locks are recovered with `into_inner`, since every
//! operation leaves the inner map consistent.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, RandomState};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const DEFAULT_SHARDS: usize = 32;
const MAX_SHARDS: usize = 256;

#[repr(align(128))]
struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K, V> Shard<K, V> {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.map.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.map.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// A concurrent hash map split into independently locked shards.
pub struct ShardedMap<K, V> {
    shards: Box<[Shard<K, V>]>,
    hasher: RandomState,
}

impl<K, V> std::fmt::Debug for ShardedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries: usize = self.shards.iter().map(|s| s.read().len()).sum();
        f.debug_struct("ShardedMap")
            .field("shards", &self.shards.len())
            .field("entries", &entries)
            .finish()
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Create with `n` shards, clamped to `[1, 256]`.
    #[must_use]
    pub fn with_shards(n: usize) -> Self {
        let n = n.clamp(1, MAX_SHARDS);
        let shards: Vec<Shard<K, V>> = (0..n).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
            hasher: RandomState::new(),
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, key: &K) -> &Shard<K, V> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Insert or replace, returning the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).write().insert(key, value)
    }

    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.shard(key).read().get(key).cloned()
    }

    /// Return the value for `key`, inserting `make()` first if absent.
    ///
    /// Check and insert happen under one shard write lock, so concurrent
    /// callers for the same key all observe the same value.
    pub fn get_or_insert_with<F>(&self, key: K, make: F) -> V
    where
        V: Clone,
        F: FnOnce() -> V,
    {
        if let Some(existing) = self.get(&key) {
            return existing;
        }
        self.shard(&key).write().entry(key).or_insert_with(make).clone()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).write().remove(key)
    }

    /// Remove `key` only if `pred` accepts its current value.
    ///
    /// `pred` runs under the shard write lock, so no other caller can read
    /// or replace the value between the check and the removal.
    pub fn remove_if<F>(&self, key: &K, pred: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let mut guard = self.shard(key).write();
        if guard.get(key).is_some_and(pred) {
            guard.remove(key)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Snapshot of all keys.
    pub fn keys(&self) -> Vec<K> {
        let mut out = Vec::new();
        for shard in &*self.shards {
            out.extend(shard.read().keys().cloned());
        }
        out
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        let mut out = Vec::new();
        for shard in &*self.shards {
            out.extend(shard.read().iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out
    }
}

impl<K: Hash + Eq + Clone, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
