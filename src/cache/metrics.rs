//! Per-outcome request counters.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};

use metrics::counter;
use tracing::warn;

use super::keys::stats_key;
use super::lock::{rw_read, rw_write};
use super::state::StateKind;
use super::store::CacheStore;

pub const METRIC_REQUESTS_TOTAL: &str = "next_boost_requests_total";
pub const METRIC_RENDER_MS: &str = "next_boost_render_ms";
pub const METRIC_RENDER_ERRORS_TOTAL: &str = "next_boost_render_errors_total";
pub const METRIC_PURGED_TOTAL: &str = "next_boost_purged_total";

/// Content type of [`MetricsCollector::render`].
pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

const SOURCE: &str = "cache::metrics";

/// Counts requests by [`StateKind`].
///
/// Counts are process-local unless a durable store is attached, in which case
/// they are tallied under `stats:<status>` and shared by every instance using
/// that store.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    counts: Arc<RwLock<BTreeMap<StateKind, u64>>>,
    durable: Option<Arc<dyn CacheStore>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn durable(store: Arc<dyn CacheStore>) -> Self {
        Self {
            counts: Arc::default(),
            durable: Some(store),
        }
    }

    pub async fn increment(&self, kind: StateKind) {
        counter!(METRIC_REQUESTS_TOTAL, "status" => kind.as_str()).increment(1);
        *rw_write(&self.counts, SOURCE, "increment")
            .entry(kind)
            .or_insert(0) += 1;

        if let Some(store) = &self.durable
            && let Err(err) = store.incr(&stats_key(kind.as_str())).await
        {
            warn!(status = %kind, error = %err, "Failed to persist request counter");
        }
    }

    /// Process-local count for `kind`.
    pub fn count(&self, kind: StateKind) -> u64 {
        rw_read(&self.counts, SOURCE, "count")
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    /// Text exposition of every observed status.
    pub async fn render(&self) -> String {
        let counts: Vec<(StateKind, u64)> = match &self.durable {
            Some(store) => {
                let mut counts = Vec::new();
                for kind in StateKind::ALL {
                    match store.count(&stats_key(kind.as_str())).await {
                        Ok(0) => {}
                        Ok(count) => counts.push((kind, count)),
                        Err(err) => {
                            warn!(status = %kind, error = %err, "Failed to read request counter");
                        }
                    }
                }
                counts
            }
            None => rw_read(&self.counts, SOURCE, "render")
                .iter()
                .map(|(kind, count)| (*kind, *count))
                .collect(),
        };

        let mut out = String::new();
        for (kind, count) in counts {
            let _ = writeln!(out, "{METRIC_REQUESTS_TOTAL}{{status='{kind}'}} {count}");
        }
        out
    }
}
