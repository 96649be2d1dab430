use std::{ffi::OsString, future::IntoFuture, path::Path, process, sync::Arc};

use next_boost::{
    application::error::AppError,
    cache::{
        CacheAdapter, CacheConfig, CacheRules, CacheState, MemoryAdapter, MetricsCollector,
        ParamFilter, RedisAdapter, SqliteAdapter, system_clock,
    },
    config::{self, CacheBackend, RendererMode, Settings},
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
    render::{RendererBridge, UpstreamFactory, UpstreamOrigin, serve_stdio, spawn_process, spawn_thread},
};
use serde_json::json;
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const WORKER_SUBCOMMAND: &str = "worker";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    match command {
        config::Command::Serve(_) => {
            telemetry::init(&settings.logging)?;
            run_serve(settings, cli_args.config_file.as_deref()).await
        }
        config::Command::Worker => {
            telemetry::init_stderr(&settings.logging)?;
            run_worker().await
        }
    }
}

async fn run_serve(settings: Settings, config_file: Option<&Path>) -> Result<(), AppError> {
    let adapter = build_adapter(&settings);
    let store = adapter.init().await?;

    let renderer = Arc::new(start_renderer(&settings, config_file)?);
    renderer
        .init(json!({ "upstream": settings.renderer.upstream.as_str() }))
        .await?;
    info!(
        mode = ?settings.renderer.mode,
        upstream = %settings.renderer.upstream,
        "Renderer ready"
    );

    let metrics = if settings.cache.durable_stats {
        MetricsCollector::durable(store.clone())
    } else {
        MetricsCollector::new()
    };
    let mut cache = CacheState::new(CacheConfig::from(&settings), store, renderer.clone())
        .with_rules(CacheRules::patterns(settings.rules.clone()))
        .with_metrics(metrics);
    if !settings.params.exclude.is_empty() {
        cache = cache.with_param_filter(ParamFilter::exclude(settings.params.exclude.clone()));
    }

    let origin = Arc::new(UpstreamOrigin::new(settings.renderer.upstream.clone())?);
    let result = serve_http(&settings, HttpState { cache, origin }).await;

    renderer.kill();
    adapter.shutdown().await;
    result
}

fn build_adapter(settings: &Settings) -> Box<dyn CacheAdapter> {
    let clock = system_clock();
    let cache = &settings.cache;
    match cache.backend {
        CacheBackend::Sqlite => Box::new(SqliteAdapter::new(cache.path.clone(), cache.tbd, clock)),
        CacheBackend::Redis => Box::new(RedisAdapter::new(
            cache.url.clone(),
            cache.key_prefix.clone(),
            cache.tbd,
            clock,
        )),
        CacheBackend::Memory => Box::new(MemoryAdapter::new(cache.tbd, clock)),
    }
}

fn start_renderer(
    settings: &Settings,
    config_file: Option<&Path>,
) -> Result<RendererBridge, AppError> {
    let bridge = match settings.renderer.mode {
        RendererMode::Thread => spawn_thread(UpstreamFactory)?,
        RendererMode::Process => {
            let program = std::env::current_exe().map_err(InfraError::from)?;
            // the worker reads the same file so it logs the same way
            let mut args = Vec::new();
            if let Some(path) = config_file {
                args.push(OsString::from("--config-file"));
                args.push(path.as_os_str().to_os_string());
            }
            args.push(OsString::from(WORKER_SUBCOMMAND));
            spawn_process(program, args)?
        }
    };
    Ok(bridge)
}

async fn run_worker() -> Result<(), AppError> {
    let result = serve_stdio(UpstreamFactory).await;
    // stdin may still be blocked in a read that the runtime cannot cancel
    match result {
        Ok(()) => process::exit(0),
        Err(err) => Err(err.into()),
    }
}

async fn serve_http(settings: &Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(addr = %settings.server.addr, "Listening");

    let shutdown = Arc::new(Notify::new());
    let trigger = shutdown.clone();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("Shutdown requested; draining connections");
            trigger.notify_one();
        })
        .into_future();

    let grace = settings.server.graceful_shutdown;
    let deadline = async {
        shutdown.notified().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => result.map_err(|err| InfraError::server(err.to_string()))?,
        () = deadline => warn!(
            grace_secs = grace.as_secs(),
            "Graceful shutdown timed out; dropping open connections"
        ),
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
