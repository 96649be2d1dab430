//! Lease-based single-flight locks stored next to the payloads they guard.
//!
//! A lease is a `lock:<key>` entry with a short absolute TTL, so an abandoned
//! lease (crashed renderer, killed process) frees itself.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::keys::lock_key;
use super::store::{CacheStatus, CacheStore, StoreError};

pub const DEFAULT_LEASE: Duration = Duration::from_secs(10);

const SENTINEL: &[u8] = b"1";

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn CacheStore>,
    lease: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn CacheStore>, lease: Duration) -> Self {
        Self { store, lease }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Take the lease whether or not someone else holds it.
    pub async fn acquire(&self, key: &str) -> Result<LockLease, StoreError> {
        self.store
            .set(&lock_key(key), Bytes::from_static(SENTINEL), self.lease)
            .await?;
        debug!(key, "Lease acquired unconditionally");
        Ok(LockLease::new(self.clone(), key))
    }

    /// Take the lease unless another renderer holds a live one.
    pub async fn try_acquire(&self, key: &str) -> Result<Option<LockLease>, StoreError> {
        let acquired = self
            .store
            .set_if_absent(&lock_key(key), Bytes::from_static(SENTINEL), self.lease)
            .await?;
        if acquired {
            debug!(key, "Lease acquired");
            Ok(Some(LockLease::new(self.clone(), key)))
        } else {
            Ok(None)
        }
    }

    pub async fn release(&self, key: &str) -> Result<(), StoreError> {
        self.store.del(&lock_key(key)).await
    }

    pub async fn is_held(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.store.has(&lock_key(key)).await? == CacheStatus::Hit)
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

/// Scoped ownership of a lease.
///
/// Call [`LockLease::release`] on the normal path. Dropping an unreleased lease
/// (error, panic, cancelled task) schedules the release on the current runtime.
#[must_use = "a lease is released when dropped"]
pub struct LockLease {
    manager: LockManager,
    key: String,
    released: bool,
}

impl LockLease {
    fn new(manager: LockManager, key: &str) -> Self {
        Self {
            manager,
            key: key.to_string(),
            released: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.manager.release(&self.key).await
    }
}

impl fmt::Debug for LockLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockLease")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let manager = self.manager.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = manager.release(&key).await {
                        warn!(key = %key, error = %err, "Failed to release dropped lease");
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "Lease dropped outside a runtime; left to expire");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::store::MemoryStore;

    fn manager() -> (LockManager, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::new(
            Duration::from_secs(60),
            Arc::new(clock.clone()),
        ));
        (LockManager::new(store, DEFAULT_LEASE), clock)
    }

    #[tokio::test]
    async fn try_acquire_is_exclusive_until_release() {
        let (locks, _) = manager();
        let lease = locks.try_acquire("/").await.expect("store").expect("first");
        assert!(locks.is_held("/").await.expect("store"));
        assert!(locks.try_acquire("/").await.expect("store").is_none());

        lease.release().await.expect("release");
        assert!(!locks.is_held("/").await.expect("store"));
        assert!(locks.try_acquire("/").await.expect("store").is_some());
    }

    #[tokio::test]
    async fn abandoned_lease_expires() {
        let (locks, clock) = manager();
        let lease = locks.try_acquire("/slow").await.expect("store").expect("lease");
        std::mem::forget(lease);

        clock.advance(Duration::from_secs(11));
        assert!(!locks.is_held("/slow").await.expect("store"));
        assert!(locks.try_acquire("/slow").await.expect("store").is_some());
    }

    #[tokio::test]
    async fn acquire_overrides_a_live_lease() {
        let (locks, _) = manager();
        let _held = locks.try_acquire("/").await.expect("store").expect("lease");
        let forced = locks.acquire("/").await.expect("forced");
        assert_eq!(forced.key(), "/");
        forced.release().await.expect("release");
    }

    #[tokio::test]
    async fn dropped_lease_is_released_in_background() {
        let (locks, _) = manager();
        {
            let _lease = locks.try_acquire("/drop").await.expect("store").expect("lease");
        }

        for _ in 0..50 {
            if !locks.is_held("/drop").await.expect("store") {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("dropped lease was never released");
    }
}
