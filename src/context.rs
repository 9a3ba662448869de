//! Explicitly constructed process context.
//!
//! Holds the one shared store connection, the bus built on it, and the
//! metrics registry. Tests open as many isolated contexts as they like.

use std::sync::Arc;

use tracing::info;

use crate::advice::Instrumented;
use crate::bus::MessageBus;
use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::storage::{init_store, StreamStore};

pub struct OmniContext {
    config: Config,
    store: Arc<dyn StreamStore>,
    bus: MessageBus,
    metrics: Arc<MetricsRegistry>,
}

impl OmniContext {
    /// Connect the configured store and build the bus on top of it.
    pub async fn open(config: &Config) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let store = init_store(&config.store).await?;
        let context = Self::with_store(config, store);
        info!(
            backend = context.store.backend(),
            consumer = %config.bus.consumer,
            "Omni context opened"
        );
        Ok(context)
    }

    /// Build a context over an existing store; every command is instrumented.
    pub fn with_store(config: &Config, store: Arc<dyn StreamStore>) -> Self {
        let metrics = Arc::new(MetricsRegistry::new(&config.metrics));
        let store: Arc<dyn StreamStore> = Arc::new(Instrumented::new(store, metrics.clone()));
        Self {
            bus: MessageBus::new(store.clone(), &config.bus),
            config: config.clone(),
            store,
            metrics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Best-effort close of the store connection. Blocked reads are aborted.
    pub async fn close(&self) {
        self.store.close().await;
        info!("Omni context closed");
    }
}
