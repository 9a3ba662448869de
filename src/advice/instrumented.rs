//! Metrics instrumentation advice.
//!
//! Wraps a stream store to record per-command latency and outcome into a
//! [`MetricsRegistry`] without modifying the store implementations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::metrics::{Labels, MetricsRegistry};
use crate::storage::{EntryId, GroupRead, Result, StreamEntry, StreamStore};

/// Store command latency in milliseconds, by backend and operation.
pub const STORE_DURATION_MS: &str = "omni_store_duration_ms";
/// Store commands issued, by backend, operation and outcome.
pub const STORE_OPS_TOTAL: &str = "omni_store_ops_total";

/// Wrapper that adds metrics instrumentation to any stream store.
///
/// Emits for every command:
/// - `omni_store_duration_ms{backend,operation}` - latency samples
/// - `omni_store_ops_total{backend,operation,outcome}` - `ok` / `error`
///
/// # Example
///
/// ```ignore
/// let store = MemoryStreamStore::new();
/// let store = Instrumented::new(store, registry.clone());
/// ```
pub struct Instrumented<T> {
    inner: T,
    registry: Arc<MetricsRegistry>,
}

impl<T: StreamStore> Instrumented<T> {
    pub fn new(inner: T, registry: Arc<MetricsRegistry>) -> Self {
        Self { inner, registry }
    }

    /// Get a reference to the inner store.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn record<R>(&self, operation: &'static str, start: Instant, result: &Result<R>) {
        let labels = Labels::new()
            .with("backend", self.inner.backend())
            .with("operation", operation);
        self.registry
            .observe(STORE_DURATION_MS, &labels, start.elapsed());

        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.registry
            .increment_counter(STORE_OPS_TOTAL, &labels.with("outcome", outcome), 1);
    }
}

#[async_trait]
impl<T: StreamStore> StreamStore for Instrumented<T> {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let start = Instant::now();
        let result = self.inner.set_if_absent(key, value, ttl).await;
        self.record("set_if_absent", start, &result);
        result
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        maxlen: Option<usize>,
    ) -> Result<EntryId> {
        let start = Instant::now();
        let result = self.inner.append(stream, fields, maxlen).await;
        self.record("append", start, &result);
        result
    }

    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> Result<bool> {
        let start = Instant::now();
        let result = self.inner.create_group(stream, group, start_id).await;
        self.record("create_group", start, &result);
        result
    }

    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<StreamEntry>> {
        let start = Instant::now();
        let result = self.inner.read_group(read).await;
        // Blocking reads measure idle wait, not store latency.
        if read.block.is_none() {
            self.record("read_group", start, &result);
        } else {
            let outcome = if result.is_ok() { "ok" } else { "error" };
            let labels = Labels::new()
                .with("backend", self.inner.backend())
                .with("operation", "read_group_blocking")
                .with("outcome", outcome);
            self.registry.increment_counter(STORE_OPS_TOTAL, &labels, 1);
        }
        result
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        let start = Instant::now();
        let result = self.inner.ack(stream, group, ids).await;
        self.record("ack", start, &result);
        result
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let start = Instant::now();
        let result = self.inner.pending_count(stream, group).await;
        self.record("pending_count", start, &result);
        result
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let start = Instant::now();
        let result = self
            .inner
            .claim_stale(stream, group, consumer, min_idle, count)
            .await;
        self.record("claim_stale", start, &result);
        result
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
