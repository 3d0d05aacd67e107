//! Ephemeral result cache.
//!
//! Time-bounded key→value store probed before the durable store. A hit
//! short-circuits submission; a miss only costs a redundant
//! recomputation. Never authoritative — the durable store is.
//!
//! Expiry is lazy on `get`, with an active `sweep` driven by the
//! engine's pump loop. `put` overwrites unconditionally
//! (last-writer-wins): unlike the durable store, no uniqueness here.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::key::CacheKey;

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

/// In-process TTL cache for completed results.
pub struct ResultCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    default_ttl: Duration,
}

impl ResultCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Store a value under `key` for `ttl`. Overwrites any existing
    /// entry and resets its deadline.
    pub fn put_with_ttl(&self, key: CacheKey, value: serde_json::Value, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Store a value under `key` for the configured default TTL.
    pub fn put(&self, key: CacheKey, value: serde_json::Value) {
        self.put_with_ttl(key, value, self.default_ttl);
    }

    /// Look up a live value. Expired entries are dropped on the way out.
    pub fn get(&self, key: &CacheKey) -> Option<serde_json::Value> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Drop all expired entries. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
