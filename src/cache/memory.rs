//! In-process backend: an LRU map behind a mutex.

use std::num::NonZeroUsize;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{BackendFuture, BackendKind, CacheBackend, CacheKey};

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

/// Process-local backend.
///
/// Entries live in a [`LruCache`]; when the configured capacity is reached the
/// least recently used entry is evicted. A TTL is checked on every read, so an
/// expired entry is never served even if nothing has swept it yet. Nothing
/// survives a restart.
///
/// Every operation completes without suspending.
pub struct MemoryBackend {
    entries: Mutex<LruCache<CacheKey, Entry>>,
}

impl MemoryBackend {
    /// A backend holding at most `capacity` entries.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// A backend with no size bound; entries leave only through expiry or
    /// deletion.
    pub fn unbounded() -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Number of stored entries, expired ones included until they are swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    fn lookup(&self, key: &CacheKey) -> Option<Bytes> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: &CacheKey, value: Bytes, ttl: Option<Duration>) {
        // A deadline past what `Instant` can represent never arrives.
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.entries
            .lock()
            .put(key.clone(), Entry { value, expires_at });
    }
}

impl CacheBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn get<'a>(&'a self, key: &'a CacheKey) -> BackendFuture<'a, Option<Bytes>> {
        let hit = self.lookup(key);
        Box::pin(std::future::ready(Ok(hit)))
    }

    fn set<'a>(
        &'a self,
        key: &'a CacheKey,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> BackendFuture<'a, ()> {
        self.store(key, value, ttl);
        Box::pin(std::future::ready(Ok(())))
    }

    fn delete<'a>(&'a self, key: &'a CacheKey) -> BackendFuture<'a, bool> {
        let existed = self.entries.lock().pop(key).is_some();
        Box::pin(std::future::ready(Ok(existed)))
    }

    fn close(&self) -> BackendFuture<'_, ()> {
        self.entries.lock().clear();
        Box::pin(std::future::ready(Ok(())))
    }
}
