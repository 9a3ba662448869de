//! omni-bus: message bus server
//!
//! Accepts channel messages over HTTP, publishes them to Redis Streams, and
//! exposes the process metrics.
//!
//! ## Architecture
//! ```text
//! POST /inbox, /outbox --> [omni-bus] --XADD--> omni.messages / omni.outbox
//!                              |
//!                              +--> GET /metrics (Prometheus), GET /monitoring (JSON)
//! ```
//!
//! ## Configuration
//! - OMNI_CONFIG: Path to a YAML config file (optional, `omni.yaml` is read if present)
//! - OMNI__STORE__URL, OMNI__SERVER__PORT, ...: Overrides for individual settings
//! - OMNI_LOG: Log filter (default: info)

use std::sync::Arc;

use tracing::info;

use omni_bus::config::Config;
use omni_bus::context::OmniContext;
use omni_bus::handlers::serve;
use omni_bus::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = Config::load(None)?;
    let context = Arc::new(OmniContext::open(&config).await?);

    info!(
        inbox = %config.bus.inbox_stream,
        outbox = %config.bus.outbox_stream,
        group = %config.bus.group,
        "omni-bus started"
    );

    let result = serve(context.clone(), shutdown_signal()).await;
    context.close().await;
    result
}
