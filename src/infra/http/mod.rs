//! HTTP surface: the cache interceptor in front of a pass-through proxy.

mod middleware;
mod proxy;

pub use middleware::{RequestContext, log_responses, set_request_context};
pub use proxy::{MAX_REQUEST_BODY, passthrough, render_request_from};

use std::sync::Arc;

use axum::{Router, middleware as axum_middleware};

use crate::cache::{CacheState, boost_layer};
use crate::render::Origin;

#[derive(Clone)]
pub struct HttpState {
    pub cache: CacheState,
    /// Handles everything the cache lets through.
    pub origin: Arc<dyn Origin>,
}

/// Build the public router.
///
/// Every request passes the cache interceptor; the ones it does not answer
/// itself fall through to [`passthrough`].
pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .fallback(passthrough)
        .layer(axum_middleware::from_fn_with_state(
            state.cache.clone(),
            boost_layer,
        ))
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
        .with_state(state)
}
