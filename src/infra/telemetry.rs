use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, Registry, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::{
    METRIC_PURGED_TOTAL, METRIC_RENDER_ERRORS_TOTAL, METRIC_RENDER_MS, METRIC_REQUESTS_TOTAL,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install a global tracing subscriber writing to stdout.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();
    install(logging, false)
}

/// Install a global tracing subscriber writing to stderr.
///
/// Renderer workers own stdout for the command protocol, so their logs go here.
pub fn init_stderr(logging: &LoggingSettings) -> Result<(), InfraError> {
    install(logging, true)
}

fn install(logging: &LoggingSettings, stderr: bool) -> Result<(), InfraError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer: BoxedLayer = match (logging.format, stderr) {
        (LogFormat::Json, false) => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        (LogFormat::Json, true) => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        (LogFormat::Compact, false) => fmt::layer().compact().with_target(true).boxed(),
        (LogFormat::Compact, true) => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .with(ErrorLayer::default())
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_REQUESTS_TOTAL,
            Unit::Count,
            "Total number of intercepted requests, labelled by cache status."
        );
        describe_histogram!(
            METRIC_RENDER_MS,
            Unit::Milliseconds,
            "Renderer round-trip latency in milliseconds."
        );
        describe_counter!(
            METRIC_RENDER_ERRORS_TOTAL,
            Unit::Count,
            "Total number of renders that failed before producing a response."
        );
        describe_counter!(
            METRIC_PURGED_TOTAL,
            Unit::Count,
            "Total number of cache entries removed by the purge timer."
        );
    });
}
