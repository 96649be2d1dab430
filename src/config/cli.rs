use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the next-boost binary.
#[derive(Debug, Parser)]
#[command(
    name = "next-boost",
    version,
    about = "Stale-while-revalidate cache in front of a server-rendered origin"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "NEXT_BOOST_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy.
    Serve(Box<ServeArgs>),
    /// Renderer worker speaking JSON lines on stdio. Spawned by `serve`.
    #[command(hide = true)]
    Worker,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the cache backend (sqlite|redis|memory).
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub cache_backend: Option<String>,

    /// Override the SQLite cache file.
    #[arg(long = "cache-path", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub cache_path: Option<PathBuf>,

    /// Override the Redis connection URL.
    #[arg(long = "cache-url", value_name = "URL")]
    pub cache_url: Option<String>,

    /// Override how long expired entries are kept for stale serving.
    #[arg(long = "cache-tbd-seconds", value_name = "SECONDS")]
    pub cache_tbd_seconds: Option<u64>,

    /// Override the renderer mode (thread|process).
    #[arg(long = "renderer-mode", value_name = "MODE")]
    pub renderer_mode: Option<String>,

    /// Override the upstream origin URL.
    #[arg(long = "upstream", value_name = "URL")]
    pub upstream: Option<String>,

    /// Toggle the metrics endpoint.
    #[arg(
        long = "metrics-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub metrics_enabled: Option<bool>,
}
