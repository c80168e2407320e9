//! Per-session connection cache.
//!
//! A [`ClientCache`] maps a key to at most one live client. Each key owns a
//! slot (`Arc<tokio::sync::Mutex<Option<Entry>>>`) held in a
//! [`ShardedMap`]; callers lock the slot for the whole
//! fetch-or-create-then-use sequence, so two requests for the same key run
//! one after the other while different keys never wait on each other.
//!
//! Installing a client into an occupied slot closes the previous one first.
//! Closing is best-effort: failures are logged, never returned.
//!
//! A slot's map entry is dropped once the slot is empty and no other task
//! holds or waits on it. [`ClientCache::remove`], [`ClientCache::remove_where`]
//! and [`ClientCache::reap`] prune this way; slots left empty by the
//! orchestrators go on the next reap.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::concurrent_map::ShardedMap;
use crate::dds::{DdsError, RetrievalClient};
use crate::events::{EventError, EventStreamClient};
use crate::model::{AppId, SessionKey};

/// A client that can live in a [`ClientCache`].
#[async_trait]
pub trait CachedClient: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

#[async_trait]
impl CachedClient for RetrievalClient {
    type Error = DdsError;

    async fn close(&mut self) -> Result<(), DdsError> {
        RetrievalClient::close(self).await
    }

    fn describe(&self) -> String {
        format!("dds {}:{} ({})", self.host(), self.port(), self.state())
    }
}

#[async_trait]
impl CachedClient for EventStreamClient {
    type Error = EventError;

    async fn close(&mut self) -> Result<(), EventError> {
        EventStreamClient::close(self).await
    }

    fn describe(&self) -> String {
        format!(
            "events app {} pid {} at {}:{}",
            self.app_id(),
            self.pid(),
            self.host(),
            self.port()
        )
    }
}

struct Entry<C> {
    client: C,
    last_activity: Instant,
}

type SlotCell<C> = Arc<Mutex<Option<Entry<C>>>>;

async fn close_quietly<C: CachedClient>(kind: &str, mut client: C) {
    let what = client.describe();
    match client.close().await {
        Ok(()) => tracing::debug!(kind, client = %what, "Closed cached client"),
        Err(err) => tracing::warn!(kind, client = %what, error = %err, "Closing cached client failed"),
    }
}

/// Exclusive access to one key's slot.
///
/// Holding a `ClientSlot` serializes all other users of the same key.
pub struct ClientSlot<C: CachedClient> {
    kind: &'static str,
    guard: OwnedMutexGuard<Option<Entry<C>>>,
}

impl<C: CachedClient> fmt::Debug for ClientSlot<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSlot")
            .field("kind", &self.kind)
            .field(
                "client",
                &self.guard.as_ref().map(|entry| entry.client.describe()),
            )
            .finish()
    }
}

impl<C: CachedClient> ClientSlot<C> {
    pub fn is_occupied(&self) -> bool {
        self.guard.is_some()
    }

    /// The cached client, marking it active.
    pub fn client_mut(&mut self) -> Option<&mut C> {
        self.guard.as_mut().map(|entry| {
            entry.last_activity = Instant::now();
            &mut entry.client
        })
    }

    pub fn client(&self) -> Option<&C> {
        self.guard.as_ref().map(|entry| &entry.client)
    }

    /// Install `client`, closing whatever was cached before.
    pub async fn put(&mut self, client: C) {
        let previous = self.guard.replace(Entry {
            client,
            last_activity: Instant::now(),
        });
        if let Some(previous) = previous {
            close_quietly(self.kind, previous.client).await;
        }
    }

    /// Close and drop the cached client. Returns whether one was present.
    pub async fn evict(&mut self) -> bool {
        match self.guard.take() {
            Some(entry) => {
                close_quietly(self.kind, entry.client).await;
                true
            }
            None => false,
        }
    }
}

/// Registry of at most one live client per key.
pub struct ClientCache<K, C> {
    kind: &'static str,
    slots: ShardedMap<K, SlotCell<C>>,
}

impl<K, C> fmt::Debug for ClientCache<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCache")
            .field("kind", &self.kind)
            .field("slots", &self.slots)
            .finish()
    }
}

impl<K, C> ClientCache<K, C>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync,
    C: CachedClient,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            slots: ShardedMap::new(),
        }
    }

    /// Drop the map entry for `key` if `guard` locks that entry's slot, the
    /// slot is empty, and the only references to it are the map's and the
    /// guard's. A waiter would hold a third.
    fn prune(&self, key: &K, guard: &OwnedMutexGuard<Option<Entry<C>>>) -> bool {
        if guard.is_some() {
            return false;
        }
        let held = OwnedMutexGuard::mutex(guard);
        self.slots
            .remove_if(key, |cell| Arc::ptr_eq(cell, held) && Arc::strong_count(held) == 2)
            .is_some()
    }

    fn cell(&self, key: K) -> SlotCell<C> {
        self.slots
            .get_or_insert_with(key, || Arc::new(Mutex::new(None)))
    }

    /// Lock the slot for `key`, waiting for any current holder.
    pub async fn slot(&self, key: K) -> ClientSlot<C> {
        let guard = self.cell(key).lock_owned().await;
        ClientSlot {
            kind: self.kind,
            guard,
        }
    }

    pub async fn contains(&self, key: &K) -> bool {
        match self.slots.get(key) {
            Some(cell) => cell.lock().await.is_some(),
            None => false,
        }
    }

    /// Install `client` for `key`, closing any previous client.
    pub async fn put(&self, key: K, client: C) {
        self.slot(key).await.put(client).await;
    }

    /// Close and drop the client for `key`. Returns whether one was present.
    pub async fn remove(&self, key: &K) -> bool {
        let Some(cell) = self.slots.get(key) else {
            return false;
        };
        let mut slot = ClientSlot {
            kind: self.kind,
            guard: cell.lock_owned().await,
        };
        let removed = slot.evict().await;
        self.prune(key, &slot.guard);
        if removed {
            tracing::info!(kind = self.kind, key = ?key, "Evicted cached client");
        }
        removed
    }

    /// Close the client of every slot whose key matches and drop the slots.
    ///
    /// Each slot is locked before its entry goes, so this waits for in-flight
    /// users to finish. A slot another task is still waiting on keeps its
    /// (empty) entry until a later reap.
    pub async fn remove_where<F>(&self, mut pred: F) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let mut closed = 0;
        for (key, cell) in self.slots.entries() {
            if !pred(&key) {
                continue;
            }
            let mut guard = cell.lock_owned().await;
            let entry = guard.take();
            self.prune(&key, &guard);
            drop(guard);
            if let Some(entry) = entry {
                tracing::info!(kind = self.kind, key = ?key, "Closing client for ended session");
                close_quietly(self.kind, entry.client).await;
                closed += 1;
            }
        }
        closed
    }

    /// Close idle or unwanted clients without waiting on busy slots, and
    /// drop slots left empty.
    ///
    /// `should_close` sees the key, the client and its idle time.
    pub async fn reap<F>(&self, mut should_close: F) -> usize
    where
        F: FnMut(&K, &C, Duration) -> bool,
    {
        let mut reaped = 0;
        for (key, cell) in self.slots.entries() {
            let Ok(mut guard) = cell.try_lock_owned() else {
                continue;
            };
            let doomed = guard
                .as_ref()
                .is_some_and(|entry| should_close(&key, &entry.client, entry.last_activity.elapsed()));
            let entry = if doomed { guard.take() } else { None };
            self.prune(&key, &guard);
            drop(guard);
            if let Some(entry) = entry {
                tracing::info!(kind = self.kind, key = ?key, "Reaped cached client");
                close_quietly(self.kind, entry.client).await;
                reaped += 1;
            }
        }
        reaped
    }

    /// Keys that currently have a slot (occupied or not).
    pub fn keys(&self) -> Vec<K> {
        self.slots.keys()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// The process-wide pair of caches: one retrieval client per session and
/// one event client per (session, worker).
#[derive(Debug)]
pub struct ConnectionCache {
    retrieval: ClientCache<SessionKey, RetrievalClient>,
    events: ClientCache<(SessionKey, AppId), EventStreamClient>,
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self {
            retrieval: ClientCache::new("retrieval"),
            events: ClientCache::new("events"),
        }
    }

    pub fn retrieval(&self) -> &ClientCache<SessionKey, RetrievalClient> {
        &self.retrieval
    }

    pub fn events(&self) -> &ClientCache<(SessionKey, AppId), EventStreamClient> {
        &self.events
    }

    /// Close every client owned by `session`. Returns how many were closed.
    pub async fn end_session(&self, session: &SessionKey) -> usize {
        let retrieval = self.retrieval.remove_where(|key| key == session).await;
        let events = self.events.remove_where(|(key, _)| key == session).await;
        retrieval + events
    }
}
