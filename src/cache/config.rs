//! Runtime knobs for the cache interceptor.

use std::time::Duration;

use axum::http::HeaderName;

use super::dispatcher::{DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_BUDGET};
use super::lease::DEFAULT_LEASE;

const DEFAULT_FORCE_HEADER: &str = "x-next-boost";
const DEFAULT_STATUS_HEADER: &str = "x-next-boost-status";
const DEFAULT_METRICS_PATH: &str = "/__nextboost_metrics";

/// Value of the force header that demands a fresh render.
pub const FORCE_VALUE: &str = "update";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Request header that forces a re-render when set to [`FORCE_VALUE`].
    pub force_header: HeaderName,
    /// Response header echoing the revalidation state.
    pub status_header: HeaderName,
    pub metrics_enabled: bool,
    pub metrics_path: String,
    pub lease: Duration,
    pub poll_interval: Duration,
    pub wait_budget: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            force_header: HeaderName::from_static(DEFAULT_FORCE_HEADER),
            status_header: HeaderName::from_static(DEFAULT_STATUS_HEADER),
            metrics_enabled: true,
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
            lease: DEFAULT_LEASE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            wait_budget: DEFAULT_WAIT_BUDGET,
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            force_header: settings.headers.force.clone(),
            status_header: settings.headers.status.clone(),
            metrics_enabled: settings.metrics.enabled,
            metrics_path: settings.metrics.path.clone(),
            lease: settings.lock.lease,
            poll_interval: settings.lock.poll_interval,
            wait_budget: settings.lock.wait_budget,
        }
    }
}
