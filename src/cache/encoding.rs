//! Gzip normalization between rendered responses, stored payloads and clients.

use std::io::{self, Read, Write};

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use tracing::{debug, warn};

use super::payload::{PagePayload, PayloadHeaders};
use crate::render::RenderResult;

const GZIP: &str = "gzip";

/// Headers that describe a single transfer and never belong in a stored copy.
const TRANSFER_HEADERS: [&str; 4] = ["content-length", "transfer-encoding", "connection", "keep-alive"];

pub fn gzip(body: &[u8]) -> io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish().map(Bytes::from)
}

pub fn gunzip(body: &[u8]) -> io::Result<Bytes> {
    let mut decoded = Vec::new();
    GzDecoder::new(body).read_to_end(&mut decoded)?;
    Ok(Bytes::from(decoded))
}

/// Whether the client's `accept-encoding` admits gzip.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|entry| {
            let mut parts = entry.split(';').map(str::trim);
            let coding = parts.next().unwrap_or_default();
            let disabled = parts.any(|param| {
                param
                    .strip_prefix("q=")
                    .and_then(|q| q.parse::<f32>().ok())
                    .is_some_and(|q| q == 0.0)
            });
            !disabled && (coding.eq_ignore_ascii_case(GZIP) || coding == "*")
        })
}

fn is_transfer_header(name: &str) -> bool {
    TRANSFER_HEADERS
        .iter()
        .any(|transfer| transfer.eq_ignore_ascii_case(name))
}

/// Turn a render into a storable payload, or `None` when it must not be cached.
///
/// Only `200` responses with a body are kept. Responses that set cookies, or whose
/// body uses an encoding other than gzip or identity, are skipped.
pub fn storable_payload(result: &RenderResult) -> io::Result<Option<PagePayload>> {
    if result.status_code != StatusCode::OK.as_u16() || result.body.is_empty() {
        return Ok(None);
    }
    if result.has_header(header::SET_COOKIE.as_str()) {
        debug!("Skipping cache store: response sets cookies");
        return Ok(None);
    }

    let body = match result
        .header(header::CONTENT_ENCODING.as_str())
        .map(str::trim)
    {
        Some(encoding) if encoding.eq_ignore_ascii_case(GZIP) => result.body.clone(),
        None => gzip(&result.body)?,
        Some(encoding) if encoding.is_empty() || encoding.eq_ignore_ascii_case("identity") => {
            gzip(&result.body)?
        }
        Some(encoding) => {
            debug!(encoding, "Skipping cache store: unsupported content encoding");
            return Ok(None);
        }
    };

    let mut headers = PayloadHeaders::new();
    for (name, value) in &result.headers {
        if is_transfer_header(name) {
            continue;
        }
        let name = name.to_ascii_lowercase();
        headers
            .entry(name)
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.clone());
    }
    headers.insert(header::CONTENT_ENCODING.as_str().to_string(), GZIP.to_string());

    Ok(Some(PagePayload::new(headers, body)))
}

/// Serve a stored payload, decompressing for clients that cannot take gzip.
pub fn payload_response(payload: &PagePayload, client_gzip: bool) -> Response {
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    if let Some(stored) = &payload.headers {
        for (name, value) in stored {
            append_header(headers, name, value);
        }
    }

    let stored_gzip = payload
        .header(header::CONTENT_ENCODING.as_str())
        .is_some_and(|encoding| encoding.eq_ignore_ascii_case(GZIP));

    let body = if stored_gzip && !client_gzip {
        match gunzip(&payload.body) {
            Ok(plain) => {
                headers.remove(header::CONTENT_ENCODING);
                plain
            }
            Err(err) => {
                warn!(error = %err, "Stored payload failed to decompress; sending as stored");
                payload.body.clone()
            }
        }
    } else {
        payload.body.clone()
    };

    *response.body_mut() = Body::from(body);
    response
}

/// Serve a fresh render to the client as produced by the origin.
pub fn render_response(result: RenderResult) -> Response {
    let status = StatusCode::from_u16(result.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Body::from(result.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &result.headers {
        if !is_transfer_header(name) {
            append_header(headers, name, value);
        }
    }
    response
}

fn append_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if is_transfer_header(name) {
        return;
    }
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.append(name, value);
        }
        _ => debug!(header = name, "Dropping unrepresentable header"),
    }
}
