//! Stream store: the single shared connection to the backing log.
//!
//! This module contains:
//! - `StreamStore` trait: one typed method per log-store command
//! - `EntryId` / `StreamEntry`: store-assigned entry identity and payload fields
//! - Implementations: Redis Streams, in-memory

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStreamStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStreamStore;

use crate::config::{StoreBackend, StoreConfig};

/// Start id that makes a new consumer group see the whole stream history.
pub const GROUP_START_BEGINNING: &str = "0";
/// Start id that makes a new consumer group see only entries appended later.
pub const GROUP_START_LATEST: &str = "$";

// ============================================================================
// Errors
// ============================================================================

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur talking to the stream store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Stream store is not connected")]
    Disconnected,

    #[error("Stream store is closed")]
    Closed,

    #[error("Consumer group '{group}' does not exist on stream '{stream}'")]
    NoGroup { stream: String, group: String },

    #[error("Invalid entry id: {0}")]
    InvalidEntryId(String),

    #[error("Unexpected reply from stream store: {0}")]
    Protocol(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

impl StorageError {
    /// Whether the failure is about connectivity and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Disconnected => true,
            #[cfg(feature = "redis")]
            StorageError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            _ => false,
        }
    }
}

// ============================================================================
// Entry identity
// ============================================================================

/// Store-assigned entry id, `<ms>-<seq>`, ordered by `(ms, seq)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest id strictly greater than `self`.
    pub fn next(self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self { ms: self.ms, seq },
            None => Self {
                ms: self.ms.saturating_add(1),
                seq: 0,
            },
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StorageError;

    /// Accepts `<ms>-<seq>` and, as Redis does, a bare `<ms>` meaning `<ms>-0`.
    fn from_str(s: &str) -> Result<Self> {
        let (ms, seq) = s.split_once('-').unwrap_or((s, "0"));
        let ms = ms
            .parse()
            .map_err(|_| StorageError::InvalidEntryId(s.to_string()))?;
        let seq = seq
            .parse()
            .map_err(|_| StorageError::InvalidEntryId(s.to_string()))?;
        Ok(Self { ms, seq })
    }
}

impl Serialize for EntryId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One entry as stored in a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Parameters of a consumer-group read of never-delivered entries.
#[derive(Debug, Clone)]
pub struct GroupRead<'a> {
    pub stream: &'a str,
    pub group: &'a str,
    pub consumer: &'a str,
    pub count: usize,
    /// `None` returns immediately when nothing is available.
    pub block: Option<Duration>,
}

// ============================================================================
// Trait
// ============================================================================

/// Command surface of the backing log store.
///
/// Every higher component issues its commands through one shared instance.
/// When the connection is down, commands fail immediately with
/// [`StorageError::Disconnected`]; nothing is queued across reconnects.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Backend label used in logs and metrics.
    fn backend(&self) -> &'static str;

    /// Set `key` only if it does not exist, expiring after `ttl`.
    ///
    /// Returns `true` if this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Append one entry; the store assigns its id.
    ///
    /// `maxlen` caps the stream length with approximate trimming.
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        maxlen: Option<usize>,
    ) -> Result<EntryId>;

    /// Create a consumer group, creating the stream if needed.
    ///
    /// Returns `false` if the group already existed.
    async fn create_group(&self, stream: &str, group: &str, start: &str) -> Result<bool>;

    /// Deliver up to `count` never-delivered entries to `consumer`.
    ///
    /// A block timeout with nothing available yields an empty list.
    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<StreamEntry>>;

    /// Acknowledge entries, retiring them from the group's pending set.
    ///
    /// Returns how many were actually pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64>;

    /// Number of entries delivered to the group but not yet acknowledged.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64>;

    /// Transfer entries pending longer than `min_idle` to `consumer`.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>>;

    /// Best-effort graceful close. Errors are swallowed.
    async fn close(&self);
}

#[async_trait]
impl<S: StreamStore + ?Sized> StreamStore for Arc<S> {
    fn backend(&self) -> &'static str {
        (**self).backend()
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        maxlen: Option<usize>,
    ) -> Result<EntryId> {
        (**self).append(stream, fields, maxlen).await
    }

    async fn create_group(&self, stream: &str, group: &str, start: &str) -> Result<bool> {
        (**self).create_group(stream, group, start).await
    }

    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<StreamEntry>> {
        (**self).read_group(read).await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        (**self).ack(stream, group, ids).await
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        (**self).pending_count(stream, group).await
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        (**self)
            .claim_stale(stream, group, consumer, min_idle, count)
            .await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the stream store based on configuration.
pub async fn init_store(
    config: &StoreConfig,
) -> std::result::Result<Arc<dyn StreamStore>, Box<dyn std::error::Error + Send + Sync>> {
    match config.backend {
        StoreBackend::Memory => {
            info!(backend = "memory", "Stream store initialized");
            Ok(Arc::new(MemoryStreamStore::new()))
        }
        StoreBackend::Redis => {
            #[cfg(feature = "redis")]
            {
                let store = RedisStreamStore::connect(config).await?;
                info!(backend = "redis", "Stream store initialized");
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "redis"))]
            {
                Err("Redis support requires the 'redis' feature. Rebuild with --features redis".into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_roundtrip_display() {
        let id: EntryId = "1700000000000-3".parse().unwrap();
        assert_eq!(id, EntryId::new(1_700_000_000_000, 3));
        assert_eq!(id.to_string(), "1700000000000-3");
        assert_eq!("0".parse::<EntryId>().unwrap(), EntryId::ZERO);
        assert_eq!("42".parse::<EntryId>().unwrap(), EntryId::new(42, 0));
    }

    #[test]
    fn test_entry_id_rejects_garbage() {
        assert!("abc".parse::<EntryId>().is_err());
        assert!("12-".parse::<EntryId>().is_err());
        assert!("-3".parse::<EntryId>().is_err());
        assert!("1-2-3".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_entry_id_ordering() {
        assert!(EntryId::new(1, 5) < EntryId::new(2, 0));
        assert!(EntryId::new(2, 0) < EntryId::new(2, 1));
        assert_eq!(EntryId::new(2, 1).next(), EntryId::new(2, 2));
        assert_eq!(EntryId::new(2, u64::MAX).next(), EntryId::new(3, 0));
    }

    #[test]
    fn test_entry_id_serializes_as_string() {
        let json = serde_json::to_string(&EntryId::new(7, 1)).unwrap();
        assert_eq!(json, "\"7-1\"");
        let back: EntryId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, EntryId::new(7, 1));
    }

    #[test]
    fn test_disconnected_is_transient() {
        assert!(StorageError::Disconnected.is_transient());
        assert!(!StorageError::Closed.is_transient());
        assert!(!StorageError::Protocol("x".into()).is_transient());
    }
}
