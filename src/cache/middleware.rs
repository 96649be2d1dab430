//! Request interceptor: rule matching, key derivation and the terminal actions of
//! the revalidation state machine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Method, Request, StatusCode, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, histogram};
use tracing::{debug, instrument, warn};

use super::config::{CacheConfig, FORCE_VALUE};
use super::dispatcher::RevalidationDispatcher;
use super::encoding::{accepts_gzip, payload_response, render_response, storable_payload};
use super::keys::{CacheKeyBuilder, ParamFilter, payload_key};
use super::lease::{LockLease, LockManager};
use super::metrics::{
    EXPOSITION_CONTENT_TYPE, METRIC_RENDER_ERRORS_TOTAL, METRIC_RENDER_MS, MetricsCollector,
};
use super::payload::{self, PagePayload};
use super::rules::CacheRules;
use super::state::{RevalidationState, StateKind};
use super::store::CacheStore;
use crate::application::error::HttpError;
use crate::render::{HeaderList, RenderError, RenderRequest, RenderResult, RendererBridge};

/// Shared state for [`boost_layer`].
#[derive(Clone)]
pub struct CacheState {
    pub config: CacheConfig,
    pub rules: CacheRules,
    pub param_filter: Option<ParamFilter>,
    pub key_builder: CacheKeyBuilder,
    pub dispatcher: RevalidationDispatcher,
    pub renderer: Arc<RendererBridge>,
    pub metrics: MetricsCollector,
}

impl CacheState {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn CacheStore>,
        renderer: Arc<RendererBridge>,
    ) -> Self {
        let locks = LockManager::new(store.clone(), config.lease);
        let dispatcher =
            RevalidationDispatcher::new(store, locks, config.poll_interval, config.wait_budget);
        Self {
            config,
            rules: CacheRules::default(),
            param_filter: None,
            key_builder: CacheKeyBuilder::default(),
            dispatcher,
            renderer,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_rules(mut self, rules: CacheRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_param_filter(mut self, filter: ParamFilter) -> Self {
        self.param_filter = Some(filter);
        self
    }

    pub fn with_key_builder(mut self, builder: CacheKeyBuilder) -> Self {
        self.key_builder = builder;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    fn store(&self) -> &Arc<dyn CacheStore> {
        self.dispatcher.store()
    }

    fn locks(&self) -> &LockManager {
        self.dispatcher.locks()
    }
}

/// Per-request inputs shared by every terminal action.
#[derive(Clone)]
struct Job {
    key: String,
    ttl: Duration,
    forced: bool,
    client_gzip: bool,
    request: RenderRequest,
}

/// Stale-while-revalidate caching for `GET`/`HEAD` requests matching the rules.
///
/// Everything else, and anything the rules reject, goes to the inner service
/// untouched. Every response carries the status header.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn boost_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if cache.config.metrics_enabled
        && request.method() == Method::GET
        && request.uri().path() == cache.config.metrics_path
    {
        return metrics_response(&cache.metrics).await;
    }

    let started = Instant::now();
    let (mut parts, body) = request.into_parts();

    if let Some(filter) = cache.param_filter.as_ref() {
        parts.uri = filter.apply(&parts.uri);
    }

    let cacheable = parts.method == Method::GET || parts.method == Method::HEAD;
    let ttl = if cacheable {
        cache.rules.resolve(&parts)
    } else {
        None
    };
    let Some(ttl) = ttl else {
        let response = next.run(Request::from_parts(parts, body)).await;
        return finish(&cache, response, StateKind::Bypass, None, started).await;
    };

    let key = cache.key_builder.build(&parts.uri, &parts.headers);
    let forced = parts
        .headers
        .get(&cache.config.force_header)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim() == FORCE_VALUE);
    let client_gzip = accepts_gzip(&parts.headers);
    let job = Job {
        request: render_request(&parts, client_gzip),
        key,
        ttl,
        forced,
        client_gzip,
    };

    let key = job.key.clone();
    let state = cache.dispatcher.decide(job.forced, &key).await;
    let (kind, response) = respond(&cache, job, state).await;
    finish(&cache, response, kind, Some(&key), started).await
}

async fn respond(cache: &CacheState, job: Job, state: RevalidationState) -> (StateKind, Response) {
    match state {
        RevalidationState::Miss => match cache.locks().try_acquire(&job.key).await {
            Ok(Some(lease)) => (
                StateKind::Miss,
                render_for_client(cache, &job, Some(lease)).await,
            ),
            Ok(None) => {
                let state = cache.dispatcher.wait_for(&job.key).await;
                serve_cached(cache, job, state)
            }
            Err(err) => {
                warn!(key = %job.key, error = %err, "Lease unavailable; rendering without it");
                (StateKind::Miss, render_for_client(cache, &job, None).await)
            }
        },
        RevalidationState::Force => {
            let lease = match cache.locks().acquire(&job.key).await {
                Ok(lease) => Some(lease),
                Err(err) => {
                    warn!(key = %job.key, error = %err, "Lease unavailable; rendering without it");
                    None
                }
            };
            (StateKind::Force, render_for_client(cache, &job, lease).await)
        }
        state => serve_cached(cache, job, state),
    }
}

/// Terminal actions that never render in the foreground.
fn serve_cached(cache: &CacheState, job: Job, state: RevalidationState) -> (StateKind, Response) {
    let kind = state.kind();
    match state {
        RevalidationState::Hit(payload) | RevalidationState::Fulfill(payload) => {
            (kind, payload_response(&payload, job.client_gzip))
        }
        RevalidationState::Stale(payload) => {
            let response = payload_response(&payload, job.client_gzip);
            spawn_revalidation(cache.clone(), job);
            (kind, response)
        }
        // a waiter that finds neither fresh nor stale content gives up like a timeout
        _ => (StateKind::Timeout, StatusCode::GATEWAY_TIMEOUT.into_response()),
    }
}

fn spawn_revalidation(cache: CacheState, job: Job) {
    tokio::spawn(async move {
        match cache.locks().try_acquire(&job.key).await {
            Ok(Some(lease)) => {
                if let Err(err) = render_and_store(&cache, &job, Some(lease)).await {
                    warn!(key = %job.key, error = %err, "Background revalidation failed");
                }
            }
            Ok(None) => debug!(key = %job.key, "Revalidation already in flight"),
            Err(err) => warn!(key = %job.key, error = %err, "Lease check failed; skipping revalidation"),
        }
    });
}

async fn render_for_client(cache: &CacheState, job: &Job, lease: Option<LockLease>) -> Response {
    match render_and_store(cache, job, lease).await {
        Ok(Rendered::Stored(payload)) => payload_response(&payload, job.client_gzip),
        Ok(Rendered::Passthrough(result)) => render_response(result),
        Err(err) => HttpError::from(err).into_response(),
    }
}

enum Rendered {
    Stored(PagePayload),
    Passthrough(RenderResult),
}

/// Render `job`, store the result when cacheable, then release the lease.
async fn render_and_store(
    cache: &CacheState,
    job: &Job,
    lease: Option<LockLease>,
) -> Result<Rendered, RenderError> {
    let started = Instant::now();
    let rendered = cache.renderer.render(job.request.clone()).await;
    histogram!(METRIC_RENDER_MS).record(started.elapsed().as_secs_f64() * 1000.0);

    let outcome = match rendered {
        Ok(result) => Ok(store_render(cache, job, result).await),
        Err(err) => {
            counter!(METRIC_RENDER_ERRORS_TOTAL).increment(1);
            Err(err)
        }
    };

    if let Some(lease) = lease
        && let Err(err) = lease.release().await
    {
        warn!(key = %job.key, error = %err, "Failed to release lease");
    }
    outcome
}

async fn store_render(cache: &CacheState, job: &Job, result: RenderResult) -> Rendered {
    let store_key = payload_key(&job.key);

    if job.forced && result.body.is_empty() {
        if let Err(err) = cache.store().del(&store_key).await {
            warn!(key = %job.key, error = %err, "Failed to drop cached page");
        }
        return Rendered::Passthrough(result);
    }
    if job.ttl.is_zero() {
        return Rendered::Passthrough(result);
    }

    let payload = match storable_payload(&result) {
        Ok(Some(payload)) => payload,
        Ok(None) => return Rendered::Passthrough(result),
        Err(err) => {
            warn!(key = %job.key, error = %err, "Failed to compress render for storage");
            return Rendered::Passthrough(result);
        }
    };

    match payload::encode(&payload) {
        Ok(encoded) => {
            if let Err(err) = cache.store().set(&store_key, encoded, job.ttl).await {
                warn!(key = %job.key, error = %err, "Failed to store rendered page");
            }
        }
        Err(err) => warn!(key = %job.key, error = %err, "Failed to encode rendered page"),
    }
    Rendered::Stored(payload)
}

async fn finish(
    cache: &CacheState,
    mut response: Response,
    kind: StateKind,
    key: Option<&str>,
    started: Instant,
) -> Response {
    response.headers_mut().insert(
        cache.config.status_header.clone(),
        HeaderValue::from_static(kind.as_str()),
    );
    cache.metrics.increment(kind).await;
    debug!(
        key = key.unwrap_or(""),
        status = %kind,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Served request"
    );
    response
}

async fn metrics_response(metrics: &MetricsCollector) -> Response {
    (
        [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
        metrics.render().await,
    )
        .into_response()
}

/// The render request for a cacheable request. `HEAD` renders the `GET` page so
/// the stored copy has a body; the upstream is only ever asked for gzip or identity.
fn render_request(parts: &Parts, client_gzip: bool) -> RenderRequest {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let mut headers: HeaderList = parts
        .headers
        .iter()
        .filter(|(name, _)| *name != header::ACCEPT_ENCODING)
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    if client_gzip {
        headers.push((header::ACCEPT_ENCODING.as_str().to_string(), "gzip".to_string()));
    }

    RenderRequest {
        method: Method::GET.as_str().to_string(),
        path,
        headers,
        body: bytes::Bytes::new(),
    }
}
