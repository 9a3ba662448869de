//! Message bus configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Default stream for inbound messages.
pub const DEFAULT_INBOX_STREAM: &str = "omni.messages";
/// Default stream for outbound messages.
pub const DEFAULT_OUTBOX_STREAM: &str = "omni.outbox";
/// Default consumer group.
pub const DEFAULT_GROUP: &str = "omni-core";
/// Default blocking-read timeout.
pub const DEFAULT_BLOCK_MS: u64 = 5000;
/// Default number of entries fetched per read.
pub const DEFAULT_READ_COUNT: usize = 1;
/// Default window during which a repeated trace id is a duplicate.
pub const DEFAULT_DEDUP_TTL_MS: u64 = 60_000;

/// Bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Stream receiving inbound messages.
    pub inbox_stream: String,
    /// Stream receiving outbound messages.
    pub outbox_stream: String,
    /// Consumer group shared by every worker process.
    pub group: String,
    /// Consumer name. Random per process so processes compete for entries.
    pub consumer: String,
    /// Blocking-read timeout in milliseconds (0 = do not block).
    pub block_ms: u64,
    /// Entries fetched per read.
    pub count: usize,
    /// Dedup window in milliseconds.
    pub dedup_ttl_ms: u64,
    /// Approximate cap applied to each stream on append.
    pub maxlen: Option<usize>,
    /// Extra append attempts after a transient failure.
    pub append_retries: usize,
    /// Delay before each extra append attempt.
    pub append_retry_delay_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbox_stream: DEFAULT_INBOX_STREAM.to_string(),
            outbox_stream: DEFAULT_OUTBOX_STREAM.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: random_consumer_id(),
            block_ms: DEFAULT_BLOCK_MS,
            count: DEFAULT_READ_COUNT,
            dedup_ttl_ms: DEFAULT_DEDUP_TTL_MS,
            maxlen: None,
            append_retries: 1,
            append_retry_delay_ms: 50,
        }
    }
}

impl BusConfig {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn append_retry_delay(&self) -> Duration {
        Duration::from_millis(self.append_retry_delay_ms)
    }
}

/// Fresh consumer id, unique per process.
pub fn random_consumer_id() -> String {
    format!("omni-{}", uuid::Uuid::new_v4().simple())
}
