//! Remote store shared by many instances.
//!
//! Each entry is a hash with `value` and `valid_until` fields. The server-side
//! expiry is `ttl + tbd`, so Redis evicts entries on its own and purging is a
//! no-op.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::debug;

use super::clock::Clock;
use super::store::{CacheStatus, CacheStore, StoreError};

// KEYS[1] entry, ARGV: value, valid_until, now, expiry in ms.
const SET_IF_ABSENT: &str = r"
local current = redis.call('HGET', KEYS[1], 'valid_until')
if current and tonumber(current) >= tonumber(ARGV[3]) then
  return 0
end
redis.call('HSET', KEYS[1], 'value', ARGV[1], 'valid_until', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return 1
";

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: String,
    tbd: Duration,
    clock: Arc<dyn Clock>,
    set_if_absent: Arc<Script>,
}

impl RedisStore {
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        tbd: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        debug!(url, "Connected redis cache store");

        Ok(Self {
            connection,
            key_prefix: key_prefix.into(),
            tbd,
            clock,
            set_if_absent: Arc::new(Script::new(SET_IF_ABSENT)),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn expiry_ms(&self, ttl: Duration) -> u64 {
        let total = ttl.saturating_add(self.tbd).as_millis();
        u64::try_from(total).unwrap_or(u64::MAX).max(1)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn tbd(&self) -> Duration {
        self.tbd
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let key = self.key(key);
        let valid_until = self.clock.now() + ttl.as_secs_f64();

        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("value")
            .arg(value.as_ref())
            .arg("valid_until")
            .arg(valid_until)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(self.expiry_ms(ttl))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.connection.clone();
        let (value, valid_until): (Option<Vec<u8>>, Option<f64>) = redis::cmd("HMGET")
            .arg(self.key(key))
            .arg("value")
            .arg("valid_until")
            .query_async(&mut conn)
            .await?;

        Ok(match (value, valid_until) {
            (Some(value), Some(valid_until))
                if CacheStatus::at(self.clock.now(), valid_until, self.tbd) != CacheStatus::Miss =>
            {
                Some(Bytes::from(value))
            }
            _ => None,
        })
    }

    async fn has(&self, key: &str) -> Result<CacheStatus, StoreError> {
        let mut conn = self.connection.clone();
        let valid_until: Option<f64> = redis::cmd("HGET")
            .arg(self.key(key))
            .arg("valid_until")
            .query_async(&mut conn)
            .await?;

        Ok(match valid_until {
            Some(valid_until) => CacheStatus::at(self.clock.now(), valid_until, self.tbd),
            None => CacheStatus::Miss,
        })
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn purge(&self) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let now = self.clock.now();
        let written: i64 = self
            .set_if_absent
            .key(self.key(key))
            .arg(value.as_ref())
            .arg(now + ttl.as_secs_f64())
            .arg(now)
            .arg(self.expiry_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: u64 = redis::cmd("INCR")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn count(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: Option<u64> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(count.unwrap_or_default())
    }
}
