//! The stale-while-revalidate state machine.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::keys::payload_key;
use super::lease::LockManager;
use super::payload::{self, PagePayload};
use super::state::RevalidationState;
use super::store::{CacheStatus, CacheStore};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_WAIT_BUDGET: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
#[error("gave up after {waited:?} waiting for the render lease on `{key}`")]
pub struct LockTimeout {
    pub key: String,
    pub waited: Duration,
}

#[derive(Clone)]
pub struct RevalidationDispatcher {
    store: Arc<dyn CacheStore>,
    locks: LockManager,
    poll_interval: Duration,
    wait_budget: Duration,
}

impl RevalidationDispatcher {
    pub fn new(
        store: Arc<dyn CacheStore>,
        locks: LockManager,
        poll_interval: Duration,
        wait_budget: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            poll_interval,
            wait_budget,
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Classify the request for `key`.
    ///
    /// Store and decode failures degrade to [`RevalidationState::Miss`].
    pub async fn decide(&self, forced: bool, key: &str) -> RevalidationState {
        if forced {
            return RevalidationState::Force;
        }

        match self.lookup(key).await {
            (CacheStatus::Hit, Some(payload)) => RevalidationState::Hit(payload),
            (CacheStatus::Stale, Some(payload)) => RevalidationState::Stale(payload),
            _ => match self.locks.is_held(key).await {
                Ok(true) => self.wait_for(key).await,
                Ok(false) => RevalidationState::Miss,
                Err(err) => {
                    warn!(key, error = %err, "Lease check failed; treating as miss");
                    RevalidationState::Miss
                }
            },
        }
    }

    /// Wait for whoever holds the lease on `key`, then classify what they left behind.
    pub async fn wait_for(&self, key: &str) -> RevalidationState {
        if let Err(err) = self.wait_until_released(key).await {
            debug!(key, error = %err, "Lease wait timed out");
            return RevalidationState::Timeout;
        }

        match self.lookup(key).await {
            (CacheStatus::Hit, Some(payload)) => RevalidationState::Fulfill(payload),
            (CacheStatus::Stale, Some(payload)) => RevalidationState::Stale(payload),
            _ => RevalidationState::Timeout,
        }
    }

    async fn wait_until_released(&self, key: &str) -> Result<(), LockTimeout> {
        let started = Instant::now();
        loop {
            match self.locks.is_held(key).await {
                Ok(false) => return Ok(()),
                Ok(true) => {}
                Err(err) => {
                    warn!(key, error = %err, "Lease check failed while waiting");
                    return Ok(());
                }
            }

            let waited = started.elapsed();
            if waited >= self.wait_budget {
                return Err(LockTimeout {
                    key: key.to_string(),
                    waited,
                });
            }
            tokio::time::sleep(self.poll_interval.min(self.wait_budget - waited)).await;
        }
    }

    async fn lookup(&self, key: &str) -> (CacheStatus, Option<PagePayload>) {
        let store_key = payload_key(key);
        let status = match self.store.has(&store_key).await {
            Ok(CacheStatus::Miss) => return (CacheStatus::Miss, None),
            Ok(status) => status,
            Err(err) => {
                warn!(key, error = %err, "Cache lookup failed; treating as miss");
                return (CacheStatus::Miss, None);
            }
        };

        let raw = match self.store.get(&store_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return (CacheStatus::Miss, None),
            Err(err) => {
                warn!(key, error = %err, "Cache read failed; treating as miss");
                return (CacheStatus::Miss, None);
            }
        };

        match payload::decode(&raw) {
            Ok(payload) => (status, Some(payload)),
            Err(err) => {
                warn!(key, error = %err, "Discarding undecodable cache entry");
                (CacheStatus::Miss, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::payload::PayloadHeaders;
    use crate::cache::store::MemoryStore;

    struct Fixture {
        dispatcher: RevalidationDispatcher,
        store: Arc<MemoryStore>,
        clock: ManualClock,
    }

    fn fixture(budget: Duration) -> Fixture {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::new(
            Duration::from_secs(5),
            Arc::new(clock.clone()),
        ));
        let locks = LockManager::new(store.clone(), Duration::from_secs(10));
        let dispatcher =
            RevalidationDispatcher::new(store.clone(), locks, Duration::from_millis(10), budget);
        Fixture {
            dispatcher,
            store,
            clock,
        }
    }

    async fn put(store: &MemoryStore, key: &str, body: &'static [u8], ttl: Duration) {
        let encoded = payload::encode(&PagePayload::new(PayloadHeaders::new(), body))
            .expect("encode");
        store.set(&payload_key(key), encoded, ttl).await.expect("set");
    }

    #[tokio::test]
    async fn forced_skips_the_store() {
        let fx = fixture(DEFAULT_WAIT_BUDGET);
        put(&fx.store, "/", b"cached", Duration::from_secs(60)).await;
        assert_eq!(fx.dispatcher.decide(true, "/").await, RevalidationState::Force);
    }

    #[tokio::test]
    async fn hit_then_stale_then_miss() {
        let fx = fixture(DEFAULT_WAIT_BUDGET);
        put(&fx.store, "/p1", b"hello", Duration::from_secs(1)).await;

        let state = fx.dispatcher.decide(false, "/p1").await;
        assert!(matches!(&state, RevalidationState::Hit(p) if p.body == Bytes::from_static(b"hello")));

        fx.clock.advance(Duration::from_secs(2));
        assert!(matches!(
            fx.dispatcher.decide(false, "/p1").await,
            RevalidationState::Stale(_)
        ));

        fx.clock.advance(Duration::from_secs(5));
        assert_eq!(fx.dispatcher.decide(false, "/p1").await, RevalidationState::Miss);
    }

    #[tokio::test]
    async fn corrupt_entry_is_a_miss() {
        let fx = fixture(DEFAULT_WAIT_BUDGET);
        fx.store
            .set(
                &payload_key("/bad"),
                Bytes::from_static(b"<html>"),
                Duration::from_secs(60),
            )
            .await
            .expect("set");
        assert_eq!(fx.dispatcher.decide(false, "/bad").await, RevalidationState::Miss);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_within_budget() {
        let fx = fixture(Duration::from_millis(100));
        let _lease = fx
            .dispatcher
            .locks()
            .try_acquire("/slow")
            .await
            .expect("store")
            .expect("lease");

        let started = Instant::now();
        assert_eq!(fx.dispatcher.decide(false, "/slow").await, RevalidationState::Timeout);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_fulfilled_when_the_render_lands() {
        let fx = fixture(DEFAULT_WAIT_BUDGET);
        let lease = fx
            .dispatcher
            .locks()
            .try_acquire("/")
            .await
            .expect("store")
            .expect("lease");

        let store = fx.store.clone();
        let renderer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            put(&store, "/", b"rendered", Duration::from_secs(60)).await;
            lease.release().await.expect("release");
        });

        let state = fx.dispatcher.decide(false, "/").await;
        assert!(
            matches!(&state, RevalidationState::Fulfill(p) if p.body == Bytes::from_static(b"rendered"))
        );
        renderer.await.expect("renderer task");
    }

    #[tokio::test]
    async fn released_without_payload_is_a_timeout() {
        let fx = fixture(DEFAULT_WAIT_BUDGET);
        assert_eq!(fx.dispatcher.wait_for("/nothing").await, RevalidationState::Timeout);
    }
}
