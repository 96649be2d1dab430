//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use axum::http::HeaderName;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::PatternRule;

const LOCAL_CONFIG_BASENAME: &str = "next-boost";
const ENV_PREFIX: &str = "NEXT_BOOST";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_PATH: &str = "./.cache.db";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_TBD_SECS: u64 = 3600;
const DEFAULT_RULE_PATTERN: &str = ".*";
const DEFAULT_RULE_TTL_SECS: f64 = 3600.0;
const DEFAULT_LEASE_SECS: u64 = 10;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_WAIT_BUDGET_MS: u64 = 10_000;
const DEFAULT_UPSTREAM: &str = "http://127.0.0.1:3001";
const DEFAULT_METRICS_PATH: &str = "/__nextboost_metrics";
const DEFAULT_FORCE_HEADER: &str = "x-next-boost";
const DEFAULT_STATUS_HEADER: &str = "x-next-boost-status";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub rules: Vec<PatternRule>,
    pub params: ParamSettings,
    pub lock: LockSettings,
    pub renderer: RendererSettings,
    pub metrics: MetricsSettings,
    pub headers: HeaderSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Sqlite,
    Redis,
    Memory,
}

impl FromStr for CacheBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown backend `{other}` (expected sqlite|redis|memory)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: CacheBackend,
    pub path: PathBuf,
    pub url: String,
    pub key_prefix: String,
    pub tbd: Duration,
    pub durable_stats: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ParamSettings {
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub lease: Duration,
    pub poll_interval: Duration,
    pub wait_budget: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererMode {
    Thread,
    Process,
}

impl FromStr for RendererMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(Self::Thread),
            "process" => Ok(Self::Process),
            other => Err(format!("unknown mode `{other}` (expected thread|process)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub mode: RendererMode,
    pub upstream: Url,
}

#[derive(Debug, Clone)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct HeaderSettings {
    pub force: HeaderName,
    pub status: HeaderName,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    if let Some(Command::Serve(args)) = cli.command.as_ref() {
        raw.apply_serve_overrides(&args.overrides);
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    rules: Option<Vec<RawRule>>,
    params: RawParamSettings,
    lock: RawLockSettings,
    renderer: RawRendererSettings,
    metrics: RawMetricsSettings,
    headers: RawHeaderSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(path) = overrides.cache_path.as_ref() {
            self.cache.path = Some(path.clone());
        }
        if let Some(url) = overrides.cache_url.as_ref() {
            self.cache.url = Some(url.clone());
        }
        if let Some(tbd) = overrides.cache_tbd_seconds {
            self.cache.tbd_seconds = Some(tbd);
        }
        if let Some(mode) = overrides.renderer_mode.as_ref() {
            self.renderer.mode = Some(mode.clone());
        }
        if let Some(upstream) = overrides.upstream.as_ref() {
            self.renderer.upstream = Some(upstream.clone());
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = Some(enabled);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            rules,
            params,
            lock,
            renderer,
            metrics,
            headers,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            rules: build_rules(rules)?,
            params: build_param_settings(params),
            lock: build_lock_settings(lock)?,
            renderer: build_renderer_settings(renderer)?,
            metrics: build_metrics_settings(metrics)?,
            headers: build_header_settings(headers)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let backend = match cache.backend {
        Some(backend) => backend
            .parse()
            .map_err(|reason| LoadError::invalid("cache.backend", reason))?,
        None => CacheBackend::Sqlite,
    };

    let path = cache
        .path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_PATH));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid("cache.path", "path must not be empty"));
    }

    let url = cache
        .url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());

    Ok(CacheSettings {
        backend,
        path,
        url,
        key_prefix: cache.key_prefix.unwrap_or_default(),
        tbd: Duration::from_secs(cache.tbd_seconds.unwrap_or(DEFAULT_TBD_SECS)),
        durable_stats: cache.durable_stats.unwrap_or(false),
    })
}

fn build_rules(rules: Option<Vec<RawRule>>) -> Result<Vec<PatternRule>, LoadError> {
    let rules = rules.unwrap_or_else(|| {
        vec![RawRule {
            regex: DEFAULT_RULE_PATTERN.to_string(),
            ttl: DEFAULT_RULE_TTL_SECS,
        }]
    });

    rules
        .into_iter()
        .map(|rule| {
            PatternRule::new(&rule.regex, rule.ttl)
                .map_err(|err| LoadError::invalid("rules", err.to_string()))
        })
        .collect()
}

fn build_param_settings(params: RawParamSettings) -> ParamSettings {
    ParamSettings {
        exclude: params
            .exclude
            .unwrap_or_default()
            .into_iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect(),
    }
}

fn build_lock_settings(lock: RawLockSettings) -> Result<LockSettings, LoadError> {
    let lease = lock.lease_seconds.unwrap_or(DEFAULT_LEASE_SECS);
    let poll = lock.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    let budget = lock.wait_budget_ms.unwrap_or(DEFAULT_WAIT_BUDGET_MS);

    for (key, value) in [
        ("lock.lease_seconds", lease),
        ("lock.poll_interval_ms", poll),
        ("lock.wait_budget_ms", budget),
    ] {
        if value == 0 {
            return Err(LoadError::invalid(key, "must be greater than zero"));
        }
    }

    Ok(LockSettings {
        lease: Duration::from_secs(lease),
        poll_interval: Duration::from_millis(poll),
        wait_budget: Duration::from_millis(budget),
    })
}

fn build_renderer_settings(renderer: RawRendererSettings) -> Result<RendererSettings, LoadError> {
    let mode = match renderer.mode {
        Some(mode) => mode
            .parse()
            .map_err(|reason| LoadError::invalid("renderer.mode", reason))?,
        None => RendererMode::Thread,
    };

    let raw_upstream = renderer
        .upstream
        .unwrap_or_else(|| DEFAULT_UPSTREAM.to_string());
    let upstream = Url::parse(raw_upstream.trim()).map_err(|err| {
        LoadError::invalid("renderer.upstream", format!("invalid url `{raw_upstream}`: {err}"))
    })?;
    if !matches!(upstream.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "renderer.upstream",
            "scheme must be http or https",
        ));
    }

    Ok(RendererSettings { mode, upstream })
}

fn build_metrics_settings(metrics: RawMetricsSettings) -> Result<MetricsSettings, LoadError> {
    let path = metrics
        .path
        .unwrap_or_else(|| DEFAULT_METRICS_PATH.to_string());
    if !path.starts_with('/') {
        return Err(LoadError::invalid("metrics.path", "path must start with `/`"));
    }

    Ok(MetricsSettings {
        enabled: metrics.enabled.unwrap_or(true),
        path,
    })
}

fn build_header_settings(headers: RawHeaderSettings) -> Result<HeaderSettings, LoadError> {
    let force = parse_header_name(
        "headers.force",
        headers.force.as_deref().unwrap_or(DEFAULT_FORCE_HEADER),
    )?;
    let status = parse_header_name(
        "headers.status",
        headers.status.as_deref().unwrap_or(DEFAULT_STATUS_HEADER),
    )?;
    Ok(HeaderSettings { force, status })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    backend: Option<String>,
    path: Option<PathBuf>,
    url: Option<String>,
    key_prefix: Option<String>,
    tbd_seconds: Option<u64>,
    durable_stats: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRule {
    regex: String,
    ttl: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawParamSettings {
    exclude: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLockSettings {
    lease_seconds: Option<u64>,
    poll_interval_ms: Option<u64>,
    wait_budget_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRendererSettings {
    mode: Option<String>,
    upstream: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMetricsSettings {
    enabled: Option<bool>,
    path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawHeaderSettings {
    force: Option<String>,
    status: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_header_name(key: &'static str, value: &str) -> Result<HeaderName, LoadError> {
    HeaderName::from_bytes(value.trim().as_bytes())
        .map_err(|err| LoadError::invalid(key, format!("invalid header name `{value}`: {err}")))
}

#[cfg(test)]
mod tests;
