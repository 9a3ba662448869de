//! HTTP boundary: inbox/outbox publish endpoints plus scrape and dashboard.
//!
//! - `POST /inbox`, `POST /outbox`: validate a channel message and publish it
//! - `GET /metrics`: Prometheus exposition text
//! - `GET /monitoring`: JSON monitoring snapshot
//! - `GET /health`: liveness

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bus::{BusError, MessageCanonical};
use crate::context::OmniContext;
use crate::metrics::{prometheus, Labels, MonitoringSnapshot};

/// Header whose value becomes `trace.trace_id` of the published envelope.
pub const TRACE_ID_HEADER: &str = "x-trace-id";
/// Publish latency in milliseconds, by stream.
pub const PUBLISH_DURATION_MS: &str = "omni_bus_publish_duration_ms";
/// Publish attempts, by stream and outcome.
pub const PUBLISH_TOTAL: &str = "omni_bus_publish_total";

/// Shared state for axum handlers.
type AppState = Arc<OmniContext>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Body of `POST /inbox` and `POST /outbox`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub to: String,
    pub from: String,
    pub content: String,
    pub direction: Direction,
}

impl ChannelMessage {
    fn check_schema(&self) -> Result<(), String> {
        for (field, value) in [
            ("channel", &self.channel),
            ("to", &self.to),
            ("from", &self.from),
            ("content", &self.content),
        ] {
            if value.trim().is_empty() {
                return Err(format!("'{field}' must not be empty"));
            }
        }
        Ok(())
    }
}

/// Start the HTTP server and run until `shutdown` resolves.
pub async fn serve(
    context: Arc<OmniContext>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = context.config().server.bind_address();
    let app = router(context);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local = listener.local_addr()?;
    info!(address = %local, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(context: Arc<OmniContext>) -> Router {
    Router::new()
        .route("/inbox", post(inbox))
        .route("/outbox", post(outbox))
        .route("/metrics", get(metrics))
        .route("/monitoring", get(monitoring))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(context): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, prometheus::CONTENT_TYPE)],
        context.metrics().render_prometheus(),
    )
        .into_response()
}

async fn monitoring(State(context): State<AppState>) -> Json<MonitoringSnapshot> {
    Json(context.metrics().snapshot())
}

async fn inbox(State(context): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let stream = context.config().bus.inbox_stream.clone();
    publish_channel_message(&context, &stream, Direction::Inbound, &headers, &body).await
}

async fn outbox(State(context): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let stream = context.config().bus.outbox_stream.clone();
    publish_channel_message(&context, &stream, Direction::Outbound, &headers, &body).await
}

async fn publish_channel_message(
    context: &OmniContext,
    stream: &str,
    expected: Direction,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    let registry = context.metrics();

    let request: ChannelMessage = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            registry.record_error();
            return reject(StatusCode::UNPROCESSABLE_ENTITY, e.to_string());
        }
    };
    if let Err(reason) = request.check_schema() {
        registry.record_error();
        return reject(StatusCode::UNPROCESSABLE_ENTITY, reason);
    }
    if request.direction != expected {
        registry.record_error();
        return reject(
            StatusCode::BAD_REQUEST,
            format!("direction must be {expected:?} for this endpoint").to_lowercase(),
        );
    }

    let payload = match serde_json::to_value(&request) {
        Ok(payload) => payload,
        Err(e) => {
            registry.record_error();
            return reject(StatusCode::UNPROCESSABLE_ENTITY, e.to_string());
        }
    };
    let message = match trace_id(headers) {
        Some(trace_id) => MessageCanonical::traced(trace_id, payload),
        None => MessageCanonical::new(payload),
    };

    let start = Instant::now();
    let result = context.bus().publish(stream, &message, None).await;
    registry.observe(
        PUBLISH_DURATION_MS,
        &Labels::new().with("stream", stream),
        start.elapsed(),
    );

    let outcome = match &result {
        Ok(Some(_)) => "ok",
        Ok(None) => "duplicate",
        Err(_) => "error",
    };
    registry.increment_counter(
        PUBLISH_TOTAL,
        &Labels::new().with("stream", stream).with("outcome", outcome),
        1,
    );

    match result {
        Ok(Some(_)) => {
            registry.record_message();
            (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
        }
        Ok(None) => (StatusCode::OK, Json(json!({ "ok": true, "duplicate": true }))).into_response(),
        Err(BusError::Validation(e)) => {
            registry.record_error();
            reject(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
        Err(e) => {
            registry.record_error();
            warn!(stream = %stream, error = %e, "Publish failed");
            reject(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

fn trace_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn reject(status: StatusCode, error: String) -> Response {
    (status, Json(json!({ "ok": false, "error": error }))).into_response()
}
