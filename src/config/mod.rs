//! Application configuration.
//!
//! Aggregates the store, bus, metrics and server settings into a single
//! `Config` that can be loaded from YAML files or environment variables.

mod messaging;
mod server;
mod storage;

pub use messaging::{
    random_consumer_id, BusConfig, DEFAULT_BLOCK_MS, DEFAULT_DEDUP_TTL_MS, DEFAULT_GROUP,
    DEFAULT_INBOX_STREAM, DEFAULT_OUTBOX_STREAM,
};
pub use server::{MetricsConfig, ServerConfig};
pub use storage::{StoreBackend, StoreConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "omni.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "OMNI_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "OMNI";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "OMNI_LOG";

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stream store connection.
    pub store: StoreConfig,
    /// Streams, consumer group and publish behavior.
    pub bus: BusConfig,
    /// In-process metrics.
    pub metrics: MetricsConfig,
    /// HTTP server.
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `omni.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g. `OMNI__BUS__GROUP`
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing: in-memory store, no blocking reads.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.store.backend = StoreBackend::Memory;
        config.bus.block_ms = 0;
        config.bus.append_retry_delay_ms = 1;
        config
    }
}
