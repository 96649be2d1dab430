//! Embedded durable store backed by a single SQLite file in WAL mode.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, warn};

use super::clock::Clock;
use super::store::{CacheStatus, CacheStore, StoreError};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 4;

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS cache (\
        key TEXT PRIMARY KEY, \
        value BLOB NOT NULL, \
        valid_until REAL NOT NULL\
    )",
    "CREATE INDEX IF NOT EXISTS cache_valid_until ON cache (valid_until)",
    "CREATE TABLE IF NOT EXISTS stats (\
        key TEXT PRIMARY KEY, \
        count INTEGER NOT NULL\
    )",
];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    tbd: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub async fn connect(
        path: impl AsRef<Path>,
        tbd: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        debug!(
            path = %path.as_ref().display(),
            tbd_secs = tbd.as_secs_f64(),
            "Opened sqlite cache store"
        );

        Ok(Self { pool, tbd, clock })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn reachable_after(&self, now: f64) -> f64 {
        now - self.tbd.as_secs_f64()
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    fn tbd(&self) -> Duration {
        self.tbd
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let valid_until = self.clock.now() + ttl.as_secs_f64();
        sqlx::query(
            "INSERT INTO cache (key, value, valid_until) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, valid_until = excluded.valid_until",
        )
        .bind(key)
        .bind(value.as_ref())
        .bind(valid_until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let cutoff = self.reachable_after(self.clock.now());
        let value: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT value FROM cache WHERE key = ?1 AND valid_until >= ?2")
                .bind(key)
                .bind(cutoff)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(Bytes::from))
    }

    async fn has(&self, key: &str) -> Result<CacheStatus, StoreError> {
        let valid_until: Option<f64> =
            sqlx::query_scalar("SELECT valid_until FROM cache WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(match valid_until {
            Some(valid_until) => CacheStatus::at(self.clock.now(), valid_until, self.tbd),
            None => CacheStatus::Miss,
        })
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM cache WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge(&self) -> Result<u64, StoreError> {
        let cutoff = self.reachable_after(self.clock.now());
        let removed = sqlx::query("DELETE FROM cache WHERE valid_until < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if removed > 0
            && let Err(err) = sqlx::query("VACUUM").execute(&self.pool).await
        {
            warn!(error = %err, "sqlite vacuum after purge failed");
        }

        Ok(removed)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let written = sqlx::query(
            "INSERT INTO cache (key, value, valid_until) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, valid_until = excluded.valid_until \
             WHERE cache.valid_until < ?4",
        )
        .bind(key)
        .bind(value.as_ref())
        .bind(now + ttl.as_secs_f64())
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(written == 1)
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "INSERT INTO stats (key, count) VALUES (?1, 1) \
             ON CONFLICT(key) DO UPDATE SET count = stats.count + 1 \
             RETURNING count",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        let count: Option<i64> = sqlx::query_scalar("SELECT count FROM stats WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(count
            .and_then(|count| u64::try_from(count).ok())
            .unwrap_or_default())
    }
}
