use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use next_boost::cache::{
    CacheAdapter, CacheStatus, CacheStore, LockManager, ManualClock, SqliteAdapter, SqliteStore,
};

const TBD: Duration = Duration::from_secs(5);

async fn open(dir: &tempfile::TempDir, clock: Arc<ManualClock>) -> SqliteStore {
    SqliteStore::connect(dir.path().join("cache.db"), TBD, clock)
        .await
        .expect("sqlite store")
}

#[tokio::test]
async fn entries_age_from_hit_to_stale_to_miss() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::default());
    let store = open(&dir, clock.clone()).await;

    store
        .set("payload:/p1", Bytes::from_static(b"page"), Duration::from_secs(1))
        .await
        .expect("set");
    assert_eq!(store.has("payload:/p1").await.expect("has"), CacheStatus::Hit);
    assert_eq!(
        store.get("payload:/p1").await.expect("get"),
        Some(Bytes::from_static(b"page"))
    );

    clock.advance(Duration::from_secs(3));
    assert_eq!(store.has("payload:/p1").await.expect("has"), CacheStatus::Stale);
    assert!(store.get("payload:/p1").await.expect("get").is_some());

    clock.advance(Duration::from_secs(5));
    assert_eq!(store.has("payload:/p1").await.expect("has"), CacheStatus::Miss);
    assert!(store.get("payload:/p1").await.expect("get").is_none());

    store.close().await;
}

#[tokio::test]
async fn purge_removes_only_entries_past_grace() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::default());
    let store = open(&dir, clock.clone()).await;

    store
        .set("payload:/old", Bytes::from_static(b"old"), Duration::from_secs(1))
        .await
        .expect("set old");
    clock.advance(Duration::from_secs(10));
    store
        .set("payload:/new", Bytes::from_static(b"new"), Duration::from_secs(1))
        .await
        .expect("set new");

    assert_eq!(store.purge().await.expect("purge"), 1);
    assert_eq!(store.has("payload:/old").await.expect("has"), CacheStatus::Miss);
    assert_eq!(store.has("payload:/new").await.expect("has"), CacheStatus::Hit);
    assert_eq!(store.purge().await.expect("purge again"), 0);
}

#[tokio::test]
async fn set_if_absent_only_replaces_expired_values() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::default());
    let store = open(&dir, clock.clone()).await;

    let ttl = Duration::from_secs(10);
    assert!(store.set_if_absent("lock:/p1", Bytes::from_static(b"1"), ttl).await.expect("first"));
    assert!(!store.set_if_absent("lock:/p1", Bytes::from_static(b"1"), ttl).await.expect("second"));

    clock.advance(Duration::from_secs(11));
    assert!(store.set_if_absent("lock:/p1", Bytes::from_static(b"1"), ttl).await.expect("after expiry"));
}

#[tokio::test]
async fn leases_are_exclusive_across_managers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::default());
    let store: Arc<dyn CacheStore> = Arc::new(open(&dir, clock.clone()).await);

    let first = LockManager::new(store.clone(), Duration::from_secs(10));
    let second = LockManager::new(store, Duration::from_secs(10));

    let lease = first.try_acquire("/p1").await.expect("acquire").expect("free");
    assert!(second.try_acquire("/p1").await.expect("contend").is_none());
    assert!(second.is_held("/p1").await.expect("held"));

    lease.release().await.expect("release");
    assert!(!second.is_held("/p1").await.expect("released"));
    assert!(second.try_acquire("/p1").await.expect("reacquire").is_some());
}

#[tokio::test]
async fn counters_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::default());

    let store = open(&dir, clock.clone()).await;
    assert_eq!(store.incr("stats:hit").await.expect("incr"), 1);
    assert_eq!(store.incr("stats:hit").await.expect("incr"), 2);
    store.close().await;

    let reopened = open(&dir, clock).await;
    assert_eq!(reopened.count("stats:hit").await.expect("count"), 2);
    assert_eq!(reopened.count("stats:miss").await.expect("count"), 0);
}

#[tokio::test]
async fn adapter_shares_one_store_and_shuts_down() {
    let dir = tempfile::tempdir().expect("tempdir");
    let adapter = SqliteAdapter::new(
        dir.path().join("adapter.db"),
        TBD,
        Arc::new(ManualClock::default()),
    );

    let first = adapter.init().await.expect("init");
    first
        .set("payload:/a", Bytes::from_static(b"a"), Duration::from_secs(60))
        .await
        .expect("set");
    let second = adapter.init().await.expect("init again");
    assert_eq!(second.has("payload:/a").await.expect("has"), CacheStatus::Hit);

    adapter.shutdown().await;
}
