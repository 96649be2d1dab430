//! Messages exchanged between the bridge and a renderer worker.
//!
//! Process workers carry these as one JSON object per line; body bytes travel
//! base64-encoded.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordered header pairs. Repeated names (e.g. `set-cookie`) are kept apart.
pub type HeaderList = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub method: String,
    /// Path and query of the page to render.
    pub path: String,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
}

impl RenderRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            headers: HeaderList::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResult {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default, with = "base64_body")]
    pub body: Bytes,
}

impl RenderResult {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }
}

fn find_header<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Bridge to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    Init { args: serde_json::Value },
    Render { id: Uuid, request: RenderRequest },
    Shutdown,
}

/// Worker to bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Ready,
    InitFailed { error: String },
    Rendered { id: Uuid, result: RenderResult },
    Failed { id: Uuid, error: String },
}

mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_travels_as_base64() {
        let event = WorkerEvent::Rendered {
            id: Uuid::nil(),
            result: RenderResult {
                status_code: 200,
                headers: vec![("content-type".into(), "text/html".into())],
                body: Bytes::from_static(&[0x1f, 0x8b, 0x00]),
            },
        };

        let line = serde_json::to_string(&event).expect("serialize");
        assert!(line.contains(r#""type":"rendered""#));
        assert!(line.contains(r#""body":"H4sA""#));

        let parsed: WorkerEvent = serde_json::from_str(&line).expect("parse");
        assert_eq!(parsed, event);
    }

    #[test]
    fn request_body_defaults_to_empty() {
        let command: WorkerCommand = serde_json::from_str(
            r#"{"type":"render","id":"00000000-0000-0000-0000-000000000000","request":{"method":"GET","path":"/"}}"#,
        )
        .expect("parse");
        let WorkerCommand::Render { request, .. } = command else {
            panic!("expected render command");
        };
        assert!(request.body.is_empty());
        assert!(request.headers.is_empty());
    }

    #[test]
    fn header_lookup_ignores_case() {
        let result = RenderResult {
            status_code: 200,
            headers: vec![("Set-Cookie".into(), "a=1".into())],
            body: Bytes::new(),
        };
        assert!(result.has_header("set-cookie"));
        assert_eq!(result.header("SET-COOKIE"), Some("a=1"));
    }
}
