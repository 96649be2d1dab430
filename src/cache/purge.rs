//! Background eviction of entries past their grace window.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::lock::mutex_lock;
use super::metrics::METRIC_PURGED_TOTAL;
use super::store::CacheStore;

const SOURCE: &str = "cache::purge";
const MAX_PERIOD: Duration = Duration::from_secs(3600);
const MIN_PERIOD: Duration = Duration::from_secs(1);

#[derive(Default)]
pub struct PurgeScheduler {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PurgeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Purge period for a store with grace window `tbd`.
    pub fn period_for(tbd: Duration) -> Duration {
        tbd.min(MAX_PERIOD).max(MIN_PERIOD)
    }

    /// Start purging `store` on a timer. Calling it again while running is a no-op.
    pub fn init(&self, store: Arc<dyn CacheStore>) {
        let mut handle = mutex_lock(&self.handle, SOURCE, "init");
        if handle.as_ref().is_some_and(|running| !running.is_finished()) {
            return;
        }

        let period = Self::period_for(store.tbd());
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                match store.purge().await {
                    Ok(removed) => {
                        counter!(METRIC_PURGED_TOTAL).increment(removed);
                        info!(removed, "Purged expired cache entries");
                    }
                    Err(err) => warn!(error = %err, "Cache purge failed"),
                }
            }
        }));
    }

    pub fn is_running(&self) -> bool {
        mutex_lock(&self.handle, SOURCE, "is_running")
            .as_ref()
            .is_some_and(|running| !running.is_finished())
    }

    pub fn stop(&self) {
        if let Some(running) = mutex_lock(&self.handle, SOURCE, "stop").take() {
            running.abort();
        }
    }
}

impl Drop for PurgeScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::store::MemoryStore;

    #[test]
    fn period_is_clamped() {
        assert_eq!(
            PurgeScheduler::period_for(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
        assert_eq!(
            PurgeScheduler::period_for(Duration::from_secs(86_400)),
            Duration::from_secs(3600)
        );
        assert_eq!(
            PurgeScheduler::period_for(Duration::from_millis(10)),
            Duration::from_secs(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn purges_on_each_period() {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::new(
            Duration::from_secs(2),
            Arc::new(clock.clone()),
        ));
        store
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(1))
            .await
            .expect("set");

        let scheduler = PurgeScheduler::new();
        scheduler.init(store.clone());
        scheduler.init(store.clone());
        assert!(scheduler.is_running());

        clock.advance(Duration::from_secs(4));
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(store.is_empty());

        scheduler.stop();
        assert!(!scheduler.is_running());
    }
}
