//! Omni message bus
//!
//! Idempotent publish and competing-consumer delivery over Redis Streams,
//! with in-process counters and duration histograms rendered for Prometheus.

pub mod advice;
pub mod bus;
pub mod config;
pub mod context;
pub mod handlers;
pub mod metrics;
pub mod storage;
pub mod utils;

pub use bus::{BusError, Delivery, MessageBus, MessageCanonical, ReadOptions};
pub use config::Config;
pub use context::OmniContext;
pub use metrics::{Labels, MetricsRegistry};
pub use storage::{EntryId, StorageError, StreamStore};
