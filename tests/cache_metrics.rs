use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request},
    middleware,
};
use bytes::Bytes;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use next_boost::cache::{
    CacheConfig, CacheRules, CacheState, MemoryStore, PatternRule, PurgeScheduler, SystemClock,
    boost_layer,
};
use next_boost::render::{
    Origin, OriginFactory, RenderError, RenderRequest, RenderResult, spawn_thread,
};
use serde_json::json;
use tower::ServiceExt;

struct StaticOrigin;

#[async_trait]
impl Origin for StaticOrigin {
    async fn handle(&self, request: RenderRequest) -> Result<RenderResult, RenderError> {
        if request.path == "/broken" {
            return Err(RenderError::Origin("template missing".to_string()));
        }
        Ok(RenderResult {
            status_code: 200,
            headers: Vec::new(),
            body: Bytes::from_static(b"<html></html>"),
        })
    }
}

struct StaticFactory;

#[async_trait]
impl OriginFactory for StaticFactory {
    async fn create(&self, _args: serde_json::Value) -> Result<Arc<dyn Origin>, RenderError> {
        Ok(Arc::new(StaticOrigin))
    }
}

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let store = Arc::new(MemoryStore::new(Duration::from_secs(1), Arc::new(SystemClock)));
    let bridge = spawn_thread(StaticFactory).expect("renderer thread");
    bridge.init(json!({})).await.expect("renderer init");

    let rules = CacheRules::patterns(vec![PatternRule::new("^/(page|broken)", 60.0).expect("rule")]);
    let state = CacheState::new(CacheConfig::default(), store.clone(), Arc::new(bridge))
        .with_rules(rules);
    let app = Router::new()
        .fallback(|| async { "passthrough" })
        .layer(middleware::from_fn_with_state(state, boost_layer));

    for uri in ["/page", "/page", "/broken", "/elsewhere"] {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("request should build");
        app.clone()
            .oneshot(request)
            .await
            .expect("router should respond");
    }

    let scheduler = PurgeScheduler::new();
    scheduler.init(store);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    scheduler.stop();

    let mut counters: HashMap<String, u64> = HashMap::new();
    let mut names = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let key = composite_key.key();
        names.push(key.name().to_string());
        if let DebugValue::Counter(count) = value {
            let status = key
                .labels()
                .find(|label| label.key() == "status")
                .map(|label| label.value().to_string());
            if let Some(status) = status {
                counters.insert(status, count);
            }
        }
    }

    for metric in [
        "next_boost_requests_total",
        "next_boost_render_ms",
        "next_boost_render_errors_total",
        "next_boost_purged_total",
    ] {
        assert!(names.iter().any(|name| name == metric), "missing metric: {metric}");
    }
    assert_eq!(counters.get("miss"), Some(&2));
    assert_eq!(counters.get("hit"), Some(&1));
    assert_eq!(counters.get("bypass"), Some(&1));
}
