//! Stream store configuration types.

use serde::Deserialize;

use crate::utils::retry::{RECONNECT_MAX, RECONNECT_STEP};

/// Stream store backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Redis Streams.
    #[default]
    Redis,
    /// In-process store (single instance, nothing persisted).
    Memory,
}

/// Stream store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend discriminator.
    pub backend: StoreBackend,
    /// Redis connection URL.
    pub url: String,
    /// Reconnect delay grows by this much per attempt.
    pub reconnect_step_ms: u64,
    /// Reconnect delay never exceeds this.
    pub reconnect_max_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: "redis://localhost:6379".to_string(),
            reconnect_step_ms: RECONNECT_STEP.as_millis() as u64,
            reconnect_max_ms: RECONNECT_MAX.as_millis() as u64,
        }
    }
}
