//! Expiring, capacity-bounded in-memory caches.
//!
//! Two instances back the bridge: a dedup set of recently seen message ids
//! and a user → conversation-token map. Both are shared across all
//! in-flight message tasks, expire entries lazily on read, and evict in
//! insertion order once the configured capacity is exceeded.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() >= ttl
    }
}

/// Thread-safe map with per-entry TTL and a FIFO capacity bound.
///
/// Expired entries are dropped on read and by [`cleanup_expired`]; the
/// insertion ring only tracks first insertions, so overwriting a live key
/// does not grow it.
///
/// [`cleanup_expired`]: ExpiringCache::cleanup_expired
pub struct ExpiringCache<K, V> {
    store: DashMap<K, CacheEntry<V>>,
    ring: Mutex<VecDeque<K>>,
    capacity: usize,
    ttl: Duration,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            store: DashMap::new(),
            ring: Mutex::new(VecDeque::new()),
            capacity,
            ttl,
        }
    }

    /// Insert or overwrite a value.
    pub fn insert(&self, key: K, value: V) {
        let prev = self.store.insert(key.clone(), CacheEntry::new(value));
        if prev.is_none() {
            self.track(key);
        }
    }

    /// Get a live value; expired entries are removed and read as absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.store.get(key)?;
        if entry.is_expired(self.ttl) {
            drop(entry);
            self.store.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Record a newly inserted key and evict oldest entries past capacity.
    ///
    /// Must not be called while holding a reference into the store. Ring
    /// slots whose key has already been removed are skipped.
    fn track(&self, key: K) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.push_back(key);
        while self.store.len() > self.capacity {
            let Some(oldest) = ring.pop_front() else {
                break;
            };
            self.store.remove(&oldest);
        }
    }

    /// Sweep out expired entries and stale ring slots.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.store.len();
        self.store.retain(|_, entry| !entry.is_expired(self.ttl));
        let removed = before.saturating_sub(self.store.len());

        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.retain(|key| self.store.contains_key(key));

        removed
    }
}

/// Set of recently processed message ids.
pub struct DedupCache {
    inner: ExpiringCache<String, ()>,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: ExpiringCache::new(capacity, ttl),
        }
    }

    /// Returns true if `id` was already recorded within the TTL window;
    /// otherwise records it and returns false.
    ///
    /// The check and the mark are one map-entry operation, which serializes
    /// concurrent calls on the same id; duplicate delivery across the lazy
    /// expiry boundary remains a tolerated weak guarantee.
    pub fn seen_or_mark(&self, id: &str) -> bool {
        match self.inner.store.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(self.inner.ttl) {
                    return true;
                }
                occupied.insert(CacheEntry::new(()));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry::new(()));
            }
        }
        // Entry guard released; safe to touch the ring. A re-marked id may
        // briefly hold two ring slots until the next sweep prunes one.
        self.inner.track(id.to_string());
        false
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn cleanup_expired(&self) -> usize {
        self.inner.cleanup_expired()
    }
}

/// User → inference conversation-token map.
pub struct ConversationCache {
    inner: ExpiringCache<String, String>,
}

impl ConversationCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: ExpiringCache::new(capacity, ttl),
        }
    }

    /// Get the user's session token; empty string means no prior context.
    pub fn get(&self, user_id: &str) -> String {
        self.inner.get(&user_id.to_string()).unwrap_or_default()
    }

    /// Store the user's session token, overwriting any prior value.
    pub fn set(&self, user_id: &str, token: &str) {
        self.inner.insert(user_id.to_string(), token.to_string());
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn cleanup_expired(&self) -> usize {
        self.inner.cleanup_expired()
    }
}
