//! Cache key derivation.
//!
//! Store keys live in three namespaces: `payload:<key>` for rendered pages,
//! `lock:<key>` for render leases and `stats:<status>` for durable counters.

use std::fmt;
use std::sync::Arc;

use axum::http::{HeaderMap, Uri};

const PAYLOAD_PREFIX: &str = "payload:";
const LOCK_PREFIX: &str = "lock:";
const STATS_PREFIX: &str = "stats:";

pub fn payload_key(key: &str) -> String {
    format!("{PAYLOAD_PREFIX}{key}")
}

pub fn lock_key(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}")
}

pub fn stats_key(status: &str) -> String {
    format!("{STATS_PREFIX}{status}")
}

/// Decides which query parameters take part in the cache key. `true` keeps the
/// parameter.
#[derive(Clone)]
pub struct ParamFilter(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl ParamFilter {
    pub fn new(keep: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(keep))
    }

    /// Drop every parameter named in `names`. A trailing `*` matches by prefix,
    /// so `utm_*` drops `utm_source` and `utm_medium`.
    pub fn exclude<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let patterns: Vec<ExcludePattern> = names
            .into_iter()
            .map(|name| ExcludePattern::parse(name.into()))
            .collect();
        Self::new(move |param| !patterns.iter().any(|pattern| pattern.matches(param)))
    }

    pub fn keeps(&self, param: &str) -> bool {
        (self.0)(param)
    }

    /// Rewrite the query of `uri`, keeping only accepted parameters. Without
    /// survivors the query is dropped entirely.
    pub fn apply(&self, uri: &Uri) -> Uri {
        let Some(query) = uri.query() else {
            return uri.clone();
        };

        let kept: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .filter(|(name, _)| self.keeps(name))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        let mut path_and_query = uri.path().to_string();
        if !kept.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(kept)
                .finish();
            path_and_query.push('?');
            path_and_query.push_str(&query);
        }

        let mut parts = uri.clone().into_parts();
        match path_and_query.parse() {
            Ok(rewritten) => {
                parts.path_and_query = Some(rewritten);
                Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
            }
            Err(_) => uri.clone(),
        }
    }
}

impl fmt::Debug for ParamFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ParamFilter(..)")
    }
}

#[derive(Debug, Clone)]
enum ExcludePattern {
    Exact(String),
    Prefix(String),
}

impl ExcludePattern {
    fn parse(raw: String) -> Self {
        match raw.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(raw),
        }
    }

    fn matches(&self, param: &str) -> bool {
        match self {
            Self::Exact(name) => name == param,
            Self::Prefix(prefix) => param.starts_with(prefix.as_str()),
        }
    }
}

/// Derives the cache key for a request. Defaults to path plus query.
#[derive(Clone)]
pub struct CacheKeyBuilder(Arc<dyn Fn(&Uri, &HeaderMap) -> String + Send + Sync>);

impl CacheKeyBuilder {
    pub fn new(build: impl Fn(&Uri, &HeaderMap) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(build))
    }

    pub fn build(&self, uri: &Uri, headers: &HeaderMap) -> String {
        (self.0)(uri, headers)
    }
}

impl Default for CacheKeyBuilder {
    fn default() -> Self {
        Self::new(|uri, _| default_key(uri))
    }
}

impl fmt::Debug for CacheKeyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CacheKeyBuilder(..)")
    }
}

pub fn default_key(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}
