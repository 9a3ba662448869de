//! Aspect-oriented advice for cross-cutting concerns.
//!
//! Wrapper types that add orthogonal behavior (metrics) without polluting
//! the store implementations.
//!
//! # Architecture
//!
//! Advice is applied at composition time, not in implementations:
//!
//! ```ignore
//! // Core implementation
//! let store = RedisStreamStore::connect(&config.store).await?;
//!
//! // Apply advice layers
//! let store = Instrumented::new(store, registry.clone());
//!
//! // Use as normal - metrics are transparent
//! store.append("omni.messages", &[("data", json)], None).await?;
//! ```
//!
//! # Available Advice
//!
//! - [`Instrumented`] - Records latency samples and outcome counters per command

mod instrumented;

pub use instrumented::{Instrumented, STORE_DURATION_MS, STORE_OPS_TOTAL};
