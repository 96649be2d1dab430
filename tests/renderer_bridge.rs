use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{Router, http::HeaderMap, routing::get};
use bytes::Bytes;
use futures::future::join_all;
use next_boost::render::{
    Origin, OriginFactory, RenderError, RenderRequest, RenderResult, spawn_process, spawn_thread,
};
use serde_json::json;

/// Echoes the request path after an optional delay; `/slow/<ms>` sleeps that long.
struct EchoOrigin {
    greeting: String,
}

#[async_trait]
impl Origin for EchoOrigin {
    async fn handle(&self, request: RenderRequest) -> Result<RenderResult, RenderError> {
        if let Some(ms) = request.path.strip_prefix("/slow/") {
            let ms = ms.parse::<u64>().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if request.path == "/panic" {
            panic!("template exploded");
        }
        if request.path == "/fail" {
            return Err(RenderError::Origin("no such page".to_string()));
        }
        Ok(RenderResult {
            status_code: 200,
            headers: vec![("x-greeting".to_string(), self.greeting.clone())],
            body: Bytes::from(request.path),
        })
    }
}

struct EchoFactory;

#[async_trait]
impl OriginFactory for EchoFactory {
    async fn create(&self, args: serde_json::Value) -> Result<Arc<dyn Origin>, RenderError> {
        let greeting = args
            .get("greeting")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| RenderError::Init("greeting required".to_string()))?;
        Ok(Arc::new(EchoOrigin {
            greeting: greeting.to_string(),
        }))
    }
}

#[tokio::test]
async fn thread_worker_renders_after_init() {
    let bridge = spawn_thread(EchoFactory).expect("spawn");
    bridge.init(json!({"greeting": "hi"})).await.expect("init");

    let result = bridge
        .render(RenderRequest::get("/about"))
        .await
        .expect("render");
    assert_eq!(result.status_code, 200);
    assert_eq!(result.header("x-greeting"), Some("hi"));
    assert_eq!(result.body.as_ref(), b"/about");
    assert_eq!(bridge.outstanding(), 0);
}

#[tokio::test]
async fn init_failure_is_reported() {
    let bridge = spawn_thread(EchoFactory).expect("spawn");
    let err = bridge.init(json!({})).await.expect_err("missing greeting");
    assert!(matches!(err, RenderError::Init(message) if message.contains("greeting")));
}

#[tokio::test]
async fn init_runs_once() {
    let bridge = spawn_thread(EchoFactory).expect("spawn");
    bridge.init(json!({"greeting": "hi"})).await.expect("init");
    let err = bridge
        .init(json!({"greeting": "again"}))
        .await
        .expect_err("second init");
    assert!(matches!(err, RenderError::Protocol(_)));
}

#[tokio::test]
async fn concurrent_renders_are_matched_to_their_callers() {
    let bridge = spawn_thread(EchoFactory).expect("spawn");
    bridge.init(json!({"greeting": "hi"})).await.expect("init");

    // later requests finish first
    let paths: Vec<String> = (0..6).map(|i| format!("/slow/{}", 120 - i * 20)).collect();
    let results = join_all(
        paths
            .iter()
            .map(|path| bridge.render(RenderRequest::get(path.clone()))),
    )
    .await;

    for (path, result) in paths.iter().zip(results) {
        assert_eq!(result.expect("render").body.as_ref(), path.as_bytes());
    }
}

#[tokio::test]
async fn origin_errors_reach_the_caller() {
    let bridge = spawn_thread(EchoFactory).expect("spawn");
    bridge.init(json!({"greeting": "hi"})).await.expect("init");

    let err = bridge
        .render(RenderRequest::get("/fail"))
        .await
        .expect_err("origin error");
    assert!(matches!(err, RenderError::Origin(message) if message == "no such page"));
    assert!(!bridge.is_closed());
}

#[tokio::test]
async fn panicking_origin_fails_only_that_render() {
    let bridge = spawn_thread(EchoFactory).expect("spawn");
    bridge.init(json!({"greeting": "hi"})).await.expect("init");

    let err = tokio::time::timeout(Duration::from_secs(3), bridge.render(RenderRequest::get("/panic")))
        .await
        .expect("render should not hang")
        .expect_err("panicked render");
    assert!(
        matches!(&err, RenderError::Origin(message) if message.contains("template exploded")),
        "unexpected error: {err:?}"
    );
    assert_eq!(bridge.outstanding(), 0);
    assert!(!bridge.is_closed());

    let result = bridge
        .render(RenderRequest::get("/after"))
        .await
        .expect("worker keeps serving");
    assert_eq!(result.body.as_ref(), b"/after");
}

#[tokio::test]
async fn killing_the_worker_fails_outstanding_renders() {
    let bridge = Arc::new(spawn_thread(EchoFactory).expect("spawn"));
    bridge.init(json!({"greeting": "hi"})).await.expect("init");

    let pending = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.render(RenderRequest::get("/slow/5000")).await })
    };
    while bridge.outstanding() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    bridge.kill();
    let err = pending
        .await
        .expect("join")
        .expect_err("worker gone");
    assert!(matches!(err, RenderError::WorkerExited(_)));

    let later = bridge
        .render(RenderRequest::get("/about"))
        .await
        .expect_err("closed bridge");
    assert!(matches!(later, RenderError::WorkerExited(_)));
    assert!(bridge.is_closed());
}

async fn start_upstream() -> String {
    let app = Router::new()
        .route("/hello", get(|| async { ([("x-origin", "axum")], "hello from upstream") }))
        .route(
            "/headers",
            get(|headers: HeaderMap| async move {
                headers
                    .get("x-trace-tag")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("missing")
                    .to_string()
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("upstream server");
    });
    format!("http://{addr}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn process_worker_proxies_to_upstream() {
    let upstream = start_upstream().await;
    let bridge =
        spawn_process(env!("CARGO_BIN_EXE_next-boost"), ["worker"]).expect("spawn worker");
    bridge
        .init(json!({ "upstream": upstream }))
        .await
        .expect("worker init");

    let result = bridge
        .render(RenderRequest::get("/hello"))
        .await
        .expect("render");
    assert_eq!(result.status_code, 200);
    assert_eq!(result.header("x-origin"), Some("axum"));
    assert_eq!(result.body.as_ref(), b"hello from upstream");

    let mut tagged = RenderRequest::get("/headers");
    tagged
        .headers
        .push(("x-trace-tag".to_string(), "forwarded".to_string()));
    let result = bridge.render(tagged).await.expect("render");
    assert_eq!(result.body.as_ref(), b"forwarded");

    bridge.kill();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn process_worker_rejects_bad_init() {
    let bridge =
        spawn_process(env!("CARGO_BIN_EXE_next-boost"), ["worker"]).expect("spawn worker");
    let err = bridge
        .init(json!({ "upstream": "not a url" }))
        .await
        .expect_err("invalid upstream");
    assert!(matches!(err, RenderError::Init(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn dead_process_fails_init() {
    let bridge = spawn_process("sh", ["-c", "read line; exit 3"]).expect("spawn sh");
    let err = bridge
        .init(json!({}))
        .await
        .expect_err("process exited");
    assert!(matches!(err, RenderError::WorkerExited(_)));
    assert!(bridge.is_closed());
}
