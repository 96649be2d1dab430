//! Cacheability rules: which requests are cached and for how long.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::request::Parts;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid rule pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid ttl for rule `{pattern}`: {ttl}")]
    Ttl { pattern: String, ttl: f64 },
}

/// One `{regex, ttl}` rule.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pattern: Regex,
    ttl: Duration,
}

impl PatternRule {
    pub fn new(pattern: &str, ttl_seconds: f64) -> Result<Self, RuleError> {
        let ttl = Duration::try_from_secs_f64(ttl_seconds).map_err(|_| RuleError::Ttl {
            pattern: pattern.to_string(),
            ttl: ttl_seconds,
        })?;
        let pattern = Regex::new(pattern).map_err(|source| RuleError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { pattern, ttl })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

type Resolver = Arc<dyn Fn(&Parts) -> Option<Duration> + Send + Sync>;

/// Ordered rule set; the first match wins.
#[derive(Clone)]
pub enum CacheRules {
    Patterns(Vec<PatternRule>),
    Resolver(Resolver),
}

impl CacheRules {
    pub fn patterns(rules: Vec<PatternRule>) -> Self {
        Self::Patterns(rules)
    }

    /// Rules computed per request. Returning `None` or a zero ttl bypasses the cache.
    pub fn resolver(resolve: impl Fn(&Parts) -> Option<Duration> + Send + Sync + 'static) -> Self {
        Self::Resolver(Arc::new(resolve))
    }

    /// TTL for the request, or `None` when it must bypass the cache.
    ///
    /// Patterns are matched against the (already filtered) path and query. A
    /// matching pattern with a zero ttl still applies: the page is served
    /// through the cache machinery but never stored.
    pub fn resolve(&self, parts: &Parts) -> Option<Duration> {
        match self {
            Self::Patterns(rules) => {
                let target = parts
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or_else(|| parts.uri.path());
                rules
                    .iter()
                    .find(|rule| rule.pattern.is_match(target))
                    .map(PatternRule::ttl)
            }
            Self::Resolver(resolve) => resolve(parts).filter(|ttl| !ttl.is_zero()),
        }
    }
}

impl Default for CacheRules {
    fn default() -> Self {
        Self::Patterns(
            PatternRule::new(".*", 3600.0)
                .map(|rule| vec![rule])
                .unwrap_or_default(),
        )
    }
}

impl fmt::Debug for CacheRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Patterns(rules) => f.debug_tuple("Patterns").field(rules).finish(),
            Self::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}
