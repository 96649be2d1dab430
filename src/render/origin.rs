//! Origins produce the pages the cache stores.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, redirect};
use url::Url;

use super::RenderError;
use super::protocol::{HeaderList, RenderRequest, RenderResult};

/// Renders one request.
#[async_trait]
pub trait Origin: Send + Sync {
    async fn handle(&self, request: RenderRequest) -> Result<RenderResult, RenderError>;
}

/// Builds the origin inside the worker from the bridge's init arguments.
#[async_trait]
pub trait OriginFactory: Send + Sync {
    async fn create(&self, args: serde_json::Value) -> Result<Arc<dyn Origin>, RenderError>;
}

/// Request headers that must not be forwarded to the upstream.
const HOP_BY_HOP: [&str; 6] = [
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
];

/// Reverse proxy to a server-rendering HTTP upstream.
#[derive(Debug, Clone)]
pub struct UpstreamOrigin {
    client: Client,
    base: Url,
}

impl UpstreamOrigin {
    pub fn new(base: Url) -> Result<Self, RenderError> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|err| RenderError::Init(format!("failed to build http client: {err}")))?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Upstream URL for an origin-form target.
    ///
    /// Only the path and query come from the request; scheme, host and port
    /// always stay those of the configured upstream, so `//host/x` is a path.
    pub fn target(&self, path_and_query: &str) -> Url {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };
        let mut url = self.base.clone();
        url.set_path(path);
        url.set_query(query);
        url.set_fragment(None);
        url
    }
}

#[async_trait]
impl Origin for UpstreamOrigin {
    async fn handle(&self, request: RenderRequest) -> Result<RenderResult, RenderError> {
        let url = self.target(&request.path);
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|err| RenderError::Origin(format!("invalid method: {err}")))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            if HOP_BY_HOP.iter().any(|hop| hop.eq_ignore_ascii_case(name)) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| RenderError::Origin(format!("upstream request failed: {err}")))?;

        let status_code = response.status().as_u16();
        let headers: HeaderList = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| RenderError::Origin(format!("upstream body failed: {err}")))?;

        Ok(RenderResult {
            status_code,
            headers,
            body,
        })
    }
}

/// Builds an [`UpstreamOrigin`] from `{"upstream": "<url>"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpstreamFactory;

#[async_trait]
impl OriginFactory for UpstreamFactory {
    async fn create(&self, args: serde_json::Value) -> Result<Arc<dyn Origin>, RenderError> {
        let raw = args
            .get("upstream")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| RenderError::Init("missing `upstream` init argument".to_string()))?;
        let base = Url::parse(raw)
            .map_err(|err| RenderError::Init(format!("invalid upstream `{raw}`: {err}")))?;
        Ok(Arc::new(UpstreamOrigin::new(base)?))
    }
}
