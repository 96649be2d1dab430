//! Stale-while-revalidate page cache.
//!
//! Cacheable requests are classified against a [`CacheStore`] into a
//! [`RevalidationState`]. Only one render per key runs at a time: the renderer
//! holds a lease stored next to the page (`lock:<key>`) and everybody else
//! either serves the stale copy or polls until the lease goes away.
//!
//! ```toml
//! [cache]
//! backend = "sqlite"
//! tbd_seconds = 3600
//!
//! [[rules]]
//! regex = "^/blog/"
//! ttl = 60
//! ```

mod adapter;
mod clock;
mod config;
mod dispatcher;
mod encoding;
mod keys;
mod lease;
pub(crate) mod lock;
mod metrics;
mod middleware;
mod payload;
mod purge;
mod redis;
mod rules;
mod sqlite;
mod state;
mod store;

pub use adapter::{CacheAdapter, MemoryAdapter, RedisAdapter, SqliteAdapter};
pub use clock::{Clock, ManualClock, SystemClock, system as system_clock};
pub use self::config::{CacheConfig, FORCE_VALUE};
pub use dispatcher::{DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_BUDGET, LockTimeout, RevalidationDispatcher};
pub use encoding::{
    accepts_gzip, gunzip, gzip, payload_response, render_response, storable_payload,
};
pub use keys::{CacheKeyBuilder, ParamFilter, default_key, lock_key, payload_key, stats_key};
pub use lease::{DEFAULT_LEASE, LockLease, LockManager};
pub use self::metrics::{
    EXPOSITION_CONTENT_TYPE, METRIC_PURGED_TOTAL, METRIC_RENDER_ERRORS_TOTAL, METRIC_RENDER_MS,
    METRIC_REQUESTS_TOTAL, MetricsCollector,
};
pub use middleware::{CacheState, boost_layer};
pub use payload::{PagePayload, PayloadError, PayloadHeaders, decode as decode_payload, encode as encode_payload};
pub use purge::PurgeScheduler;
pub use self::redis::RedisStore;
pub use rules::{CacheRules, PatternRule, RuleError};
pub use sqlite::SqliteStore;
pub use state::{RevalidationState, StateKind};
pub use store::{CacheStatus, CacheStore, MemoryStore, StoreError};
