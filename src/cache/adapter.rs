//! Cache adapters build a store and own whatever runs beside it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::clock::Clock;
use super::purge::PurgeScheduler;
use super::redis::RedisStore;
use super::sqlite::SqliteStore;
use super::store::{CacheStore, MemoryStore, StoreError};

#[async_trait]
pub trait CacheAdapter: Send + Sync {
    async fn init(&self) -> Result<Arc<dyn CacheStore>, StoreError>;
    async fn shutdown(&self);
}

/// SQLite file store plus its purge timer.
pub struct SqliteAdapter {
    path: PathBuf,
    tbd: Duration,
    clock: Arc<dyn Clock>,
    purge: PurgeScheduler,
    store: tokio::sync::OnceCell<SqliteStore>,
}

impl SqliteAdapter {
    pub fn new(path: impl Into<PathBuf>, tbd: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            tbd,
            clock,
            purge: PurgeScheduler::new(),
            store: tokio::sync::OnceCell::new(),
        }
    }
}

#[async_trait]
impl CacheAdapter for SqliteAdapter {
    async fn init(&self) -> Result<Arc<dyn CacheStore>, StoreError> {
        let store = self
            .store
            .get_or_try_init(|| SqliteStore::connect(&self.path, self.tbd, self.clock.clone()))
            .await?
            .clone();
        let store: Arc<dyn CacheStore> = Arc::new(store);
        self.purge.init(store.clone());
        Ok(store)
    }

    async fn shutdown(&self) {
        self.purge.stop();
        if let Some(store) = self.store.get() {
            store.close().await;
        }
    }
}

/// Shared Redis store. Redis expires keys itself, so no purge timer runs.
pub struct RedisAdapter {
    url: String,
    key_prefix: String,
    tbd: Duration,
    clock: Arc<dyn Clock>,
}

impl RedisAdapter {
    pub fn new(
        url: impl Into<String>,
        key_prefix: impl Into<String>,
        tbd: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            url: url.into(),
            key_prefix: key_prefix.into(),
            tbd,
            clock,
        }
    }
}

#[async_trait]
impl CacheAdapter for RedisAdapter {
    async fn init(&self) -> Result<Arc<dyn CacheStore>, StoreError> {
        let store = RedisStore::connect(
            &self.url,
            self.key_prefix.clone(),
            self.tbd,
            self.clock.clone(),
        )
        .await?;
        Ok(Arc::new(store))
    }

    async fn shutdown(&self) {}
}

/// In-process store plus its purge timer.
pub struct MemoryAdapter {
    store: Arc<MemoryStore>,
    purge: PurgeScheduler,
}

impl MemoryAdapter {
    pub fn new(tbd: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(MemoryStore::new(tbd, clock)),
            purge: PurgeScheduler::new(),
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }
}

#[async_trait]
impl CacheAdapter for MemoryAdapter {
    async fn init(&self) -> Result<Arc<dyn CacheStore>, StoreError> {
        let store: Arc<dyn CacheStore> = self.store.clone();
        self.purge.init(store.clone());
        Ok(store)
    }

    async fn shutdown(&self) {
        self.purge.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;

    #[tokio::test]
    async fn memory_adapter_shares_one_store() {
        let adapter = MemoryAdapter::new(Duration::from_secs(60), Arc::new(ManualClock::default()));
        let first = adapter.init().await.expect("init");
        first
            .set("k", bytes::Bytes::from_static(b"v"), Duration::from_secs(1))
            .await
            .expect("set");
        let second = adapter.init().await.expect("init again");
        assert!(second.get("k").await.expect("get").is_some());
        assert!(adapter.purge.is_running());

        adapter.shutdown().await;
        assert!(!adapter.purge.is_running());
    }
}
