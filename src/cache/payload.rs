//! Binary codec for cached pages.
//!
//! Layout: `%NB%` magic, big-endian `u32` length of the header JSON, the header
//! JSON itself, then the raw body bytes.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"%NB%";
const LENGTH_SIZE: usize = 4;
const PREFIX_SIZE: usize = MAGIC.len() + LENGTH_SIZE;

/// Header map stored alongside a cached body.
pub type PayloadHeaders = BTreeMap<String, String>;

/// The cached representation of one rendered response.
///
/// `body` is always gzip-compressed once it reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PagePayload {
    pub headers: Option<PayloadHeaders>,
    pub body: Bytes,
}

impl PagePayload {
    pub fn new(headers: PayloadHeaders, body: impl Into<Bytes>) -> Self {
        Self {
            headers: Some(headers),
            body: body.into(),
        }
    }

    /// Look up a header by its lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|headers| headers.get(name))
            .map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid payload: {reason}")]
    InvalidPayload { reason: String },
}

impl PayloadError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
        }
    }
}

/// Pack headers and body into the cache blob format.
pub fn encode(payload: &PagePayload) -> Result<Bytes, PayloadError> {
    let headers = serde_json::to_vec(&payload.headers)
        .map_err(|err| PayloadError::invalid(format!("unserializable headers: {err}")))?;
    let header_len = u32::try_from(headers.len())
        .map_err(|_| PayloadError::invalid("header block exceeds u32 range"))?;

    let mut buf = BytesMut::with_capacity(PREFIX_SIZE + headers.len() + payload.body.len());
    buf.put_slice(MAGIC);
    buf.put_u32(header_len);
    buf.put_slice(&headers);
    buf.put_slice(&payload.body);
    Ok(buf.freeze())
}

/// Unpack a cache blob.
///
/// An empty input decodes to an empty payload; anything that does not start
/// with the magic marker is rejected.
pub fn decode(raw: &[u8]) -> Result<PagePayload, PayloadError> {
    if raw.is_empty() {
        return Ok(PagePayload {
            headers: Some(PayloadHeaders::new()),
            body: Bytes::new(),
        });
    }

    if raw.len() < MAGIC.len() || &raw[..MAGIC.len()] != MAGIC {
        return Err(PayloadError::invalid("missing magic marker"));
    }
    if raw.len() < PREFIX_SIZE {
        return Err(PayloadError::invalid("truncated header length"));
    }

    let mut len_bytes = [0u8; LENGTH_SIZE];
    len_bytes.copy_from_slice(&raw[MAGIC.len()..PREFIX_SIZE]);
    let header_len = u32::from_be_bytes(len_bytes) as usize;

    let header_end = PREFIX_SIZE
        .checked_add(header_len)
        .filter(|end| *end <= raw.len())
        .ok_or_else(|| PayloadError::invalid("header block exceeds payload"))?;

    let headers: Option<PayloadHeaders> = serde_json::from_slice(&raw[PREFIX_SIZE..header_end])
        .map_err(|err| PayloadError::invalid(format!("malformed header json: {err}")))?;

    Ok(PagePayload {
        headers,
        body: Bytes::copy_from_slice(&raw[header_end..]),
    })
}
