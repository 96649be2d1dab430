use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
};

use http_body_util::{BodyExt, Limited};

use super::HttpState;
use crate::application::error::HttpError;
use crate::cache::render_response;
use crate::render::{HeaderList, RenderRequest};

const SOURCE: &str = "infra::http::proxy";

/// Largest request body forwarded to the origin.
pub const MAX_REQUEST_BODY: usize = 8 * 1024 * 1024;

/// Forward a request the cache did not answer to the origin as-is.
pub async fn passthrough(State(state): State<HttpState>, request: Request<Body>) -> Response {
    let request = match render_request_from(request).await {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };

    match state.origin.handle(request).await {
        Ok(result) => render_response(result),
        Err(err) => HttpError::from(err).into_response(),
    }
}

/// Buffer an incoming request into its wire form.
pub async fn render_request_from(request: Request<Body>) -> Result<RenderRequest, HttpError> {
    let (parts, body) = request.into_parts();
    let body = match BodyExt::collect(Limited::new(body, MAX_REQUEST_BODY)).await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            return Err(HttpError::new(
                SOURCE,
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
                err.to_string(),
            ));
        }
    };

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let headers: HeaderList = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    Ok(RenderRequest {
        method: parts.method.as_str().to_string(),
        path,
        headers,
        body,
    })
}
