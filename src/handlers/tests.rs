use std::sync::Arc;

use axum::body::Body;
use http::Request;
use serde_json::{json, Value};
use tower::ServiceExt;

use super::http::{PUBLISH_TOTAL, TRACE_ID_HEADER};
use super::router;
use crate::bus::ReadOptions;
use crate::config::Config;
use crate::context::OmniContext;
use crate::metrics::Labels;
use crate::storage::{MemoryStreamStore, StreamStore};

fn context_with_store() -> (Arc<OmniContext>, Arc<MemoryStreamStore>) {
    let store = Arc::new(MemoryStreamStore::new());
    let context = OmniContext::with_store(&Config::for_test(), store.clone());
    (Arc::new(context), store)
}

fn channel_message(direction: &str) -> Value {
    json!({
        "channel": "whatsapp",
        "to": "+15550001",
        "from": "+15550002",
        "content": "hello",
        "direction": direction,
    })
}

fn post(path: &str, body: &Value, trace_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(trace_id) = trace_id {
        builder = builder.header(TRACE_ID_HEADER, trace_id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let (context, _store) = context_with_store();
    let resp = router(context).oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
}

#[tokio::test]
async fn test_inbox_publishes_to_inbox_stream() {
    let (context, store) = context_with_store();
    let app = router(context.clone());

    let resp = app
        .oneshot(post("/inbox", &channel_message("inbound"), Some("wa-1")))
        .await
        .unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({"ok": true}));

    assert_eq!(store.len("omni.messages"), 1);
    let items = context
        .bus()
        .read(&ReadOptions::new("omni.messages", "g", "c"))
        .await
        .unwrap();
    assert_eq!(items[0].message.trace_id(), Some("wa-1"));
    assert_eq!(items[0].message.payload["content"], "hello");
    assert_eq!(items[0].message.payload["direction"], "inbound");
}

#[tokio::test]
async fn test_outbox_publishes_to_outbox_stream() {
    let (context, store) = context_with_store();

    let resp = router(context)
        .oneshot(post("/outbox", &channel_message("outbound"), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(store.len("omni.outbox"), 1);
    assert!(store.is_empty("omni.messages"));
}

#[tokio::test]
async fn test_duplicate_trace_is_ok_but_not_stored() {
    let (context, store) = context_with_store();
    let body = channel_message("inbound");

    let first = router(context.clone())
        .oneshot(post("/inbox", &body, Some("dup")))
        .await
        .unwrap();
    let second = router(context.clone())
        .oneshot(post("/inbox", &body, Some("dup")))
        .await
        .unwrap();

    assert_eq!(first.status(), http::StatusCode::OK);
    assert_eq!(second.status(), http::StatusCode::OK);
    assert_eq!(body_json(second).await, json!({"ok": true, "duplicate": true}));
    assert_eq!(store.len("omni.messages"), 1);

    let labels = Labels::new()
        .with("stream", "omni.messages")
        .with("outcome", "duplicate");
    assert_eq!(context.metrics().counter(PUBLISH_TOTAL, &labels), 1);
}

#[tokio::test]
async fn test_direction_mismatch_is_bad_request() {
    let (context, store) = context_with_store();

    let resp = router(context.clone())
        .oneshot(post("/inbox", &channel_message("outbound"), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), http::StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["ok"], false);
    assert!(store.is_empty("omni.messages"));
    assert_eq!(context.metrics().totals().errors, 1);
}

#[tokio::test]
async fn test_schema_failures_are_unprocessable() {
    let (context, store) = context_with_store();

    let mut missing = channel_message("inbound");
    missing.as_object_mut().unwrap().remove("content");
    let mut blank = channel_message("inbound");
    blank["to"] = json!("  ");
    let unknown_direction = channel_message("sideways");

    for body in [missing, blank, unknown_direction] {
        let resp = router(context.clone())
            .oneshot(post("/inbox", &body, None))
            .await
            .unwrap();
        assert_eq!(resp.status(), http::StatusCode::UNPROCESSABLE_ENTITY);
    }

    let resp = router(context)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/inbox")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), http::StatusCode::UNPROCESSABLE_ENTITY);
    assert!(store.is_empty("omni.messages"));
    assert_eq!(store.set_if_absent_calls(), 0);
}

#[tokio::test]
async fn test_publish_failure_after_retry_is_bad_gateway() {
    let (context, store) = context_with_store();
    store.fail_next_appends(2);

    let resp = router(context.clone())
        .oneshot(post("/inbox", &channel_message("inbound"), Some("t-502")))
        .await
        .unwrap();
    assert_eq!(resp.status(), http::StatusCode::BAD_GATEWAY);
    assert!(store.is_empty("omni.messages"));

    let labels = Labels::new()
        .with("stream", "omni.messages")
        .with("outcome", "error");
    assert_eq!(context.metrics().counter(PUBLISH_TOTAL, &labels), 1);
}

#[tokio::test]
async fn test_single_transient_failure_is_absorbed() {
    let (context, store) = context_with_store();
    store.fail_next_appends(1);

    let resp = router(context)
        .oneshot(post("/inbox", &channel_message("inbound"), Some("t-retry")))
        .await
        .unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(store.len("omni.messages"), 1);
    assert_eq!(store.set_if_absent_calls(), 1);
}

#[tokio::test]
async fn test_metrics_endpoint_renders_exposition_text() {
    let (context, _store) = context_with_store();
    router(context.clone())
        .oneshot(post("/inbox", &channel_message("inbound"), None))
        .await
        .unwrap();

    let resp = router(context).oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(
        resp.headers()["content-type"],
        "text/plain; version=0.0.4"
    );

    let text = body_text(resp).await;
    assert!(text.contains("omni_msgs_per_hour 1\n"));
    assert!(text.contains("# TYPE omni_bus_publish_duration_ms histogram\n"));
    assert!(text.contains(r#"omni_bus_publish_duration_ms_count{stream="omni.messages"} 1"#));
    assert!(text.contains(r#"omni_bus_publish_total{outcome="ok",stream="omni.messages"} 1"#));
    assert!(text.contains(r#"omni_store_ops_total{backend="memory",operation="append",outcome="ok"} 1"#));
}

#[tokio::test]
async fn test_monitoring_endpoint_returns_snapshot() {
    let (context, _store) = context_with_store();
    router(context.clone())
        .oneshot(post("/inbox", &channel_message("inbound"), None))
        .await
        .unwrap();

    let resp = router(context).oneshot(get("/monitoring")).await.unwrap();
    assert_eq!(resp.status(), http::StatusCode::OK);

    let json = body_json(resp).await;
    assert_eq!(json["msgs_per_hour"], 1);
    assert_eq!(json["totals"]["msgs"], 1);
    let stats = &json["durations"]["omni_bus_publish_duration_ms"][r#"stream="omni.messages""#];
    assert_eq!(stats["count"], 1);
}

#[tokio::test]
async fn test_closed_store_yields_bad_gateway() {
    let (context, store) = context_with_store();
    store.close().await;

    let resp = router(context)
        .oneshot(post("/outbox", &channel_message("outbound"), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), http::StatusCode::BAD_GATEWAY);
}
