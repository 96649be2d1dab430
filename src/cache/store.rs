//! Cache store contract and the in-process memory backend.
//!
//! Every backend keeps `(key, value, valid_until)` rows and derives the
//! [`CacheStatus`] of a key from the current time alone, so the dispatcher and
//! the lock manager never care which backend they talk to.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use super::clock::Clock;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

/// Freshness of a key at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
}

impl CacheStatus {
    /// Classify an entry valid until `valid_until`, kept for `tbd` seconds longer.
    pub fn at(now: f64, valid_until: f64, tbd: Duration) -> Self {
        if now <= valid_until {
            CacheStatus::Hit
        } else if now <= valid_until + tbd.as_secs_f64() {
            CacheStatus::Stale
        } else {
            CacheStatus::Miss
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Stale => "stale",
            CacheStatus::Miss => "miss",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite store error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("redis store error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

/// Key/value store with per-key expiry and a grace window before deletion.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Grace window kept after an entry's validity ends.
    fn tbd(&self) -> Duration;

    /// Upsert `value`, valid for `ttl` from now.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;

    /// Value for `key`, absent once the grace window has passed.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn has(&self, key: &str) -> Result<CacheStatus, StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Physically remove every entry past its grace window. Returns the count removed.
    async fn purge(&self) -> Result<u64, StoreError>;

    /// Atomically upsert `value` unless `key` is currently a hit.
    ///
    /// Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Increment a durable counter, returning the new count.
    async fn incr(&self, key: &str) -> Result<u64, StoreError>;

    async fn count(&self, key: &str) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Bytes,
    valid_until: f64,
}

/// In-process store; contents die with the process.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    counters: RwLock<HashMap<String, u64>>,
    tbd: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(tbd: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            tbd,
            clock,
        }
    }

    /// Number of physically retained entries, reachable or not.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "memory_len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn status_of(&self, entry: Option<&MemoryEntry>) -> CacheStatus {
        match entry {
            Some(entry) => CacheStatus::at(self.clock.now(), entry.valid_until, self.tbd),
            None => CacheStatus::Miss,
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn tbd(&self) -> Duration {
        self.tbd
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let valid_until = self.clock.now() + ttl.as_secs_f64();
        rw_write(&self.entries, SOURCE, "memory_set")
            .insert(key.to_string(), MemoryEntry { value, valid_until });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let entries = rw_read(&self.entries, SOURCE, "memory_get");
        let entry = entries.get(key);
        Ok(match self.status_of(entry) {
            CacheStatus::Miss => None,
            _ => entry.map(|entry| entry.value.clone()),
        })
    }

    async fn has(&self, key: &str) -> Result<CacheStatus, StoreError> {
        let entries = rw_read(&self.entries, SOURCE, "memory_has");
        Ok(self.status_of(entries.get(key)))
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        rw_write(&self.entries, SOURCE, "memory_del").remove(key);
        Ok(())
    }

    async fn purge(&self) -> Result<u64, StoreError> {
        let cutoff = self.clock.now() - self.tbd.as_secs_f64();
        let mut entries = rw_write(&self.entries, SOURCE, "memory_purge");
        let before = entries.len();
        entries.retain(|_, entry| entry.valid_until >= cutoff);
        Ok((before - entries.len()) as u64)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut entries = rw_write(&self.entries, SOURCE, "memory_set_if_absent");
        if entries
            .get(key)
            .is_some_and(|entry| CacheStatus::at(now, entry.valid_until, self.tbd) == CacheStatus::Hit)
        {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                valid_until: now + ttl.as_secs_f64(),
            },
        );
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut counters = rw_write(&self.counters, SOURCE, "memory_incr");
        let count = counters.entry(key.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        Ok(rw_read(&self.counters, SOURCE, "memory_count")
            .get(key)
            .copied()
            .unwrap_or(0))
    }
}
