//! Message bus over consumer-group streams.
//!
//! This module contains:
//! - `MessageBus`: publish/read/ack facade over one shared `StreamStore`
//! - `MessageCanonical`: the validated envelope stored in every entry
//! - `DedupGuard`: trace-id reservation backing idempotent publish
//! - `Publisher` / `PublishPhase`: the two-phase publish state machine
//! - `ReadOptions` / `Delivery` / `AckHandle`: at-least-once consumption

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

pub mod consumer;
pub mod dedup;
pub mod message;
pub mod publish;

pub use consumer::{AckHandle, Delivery, ReadOptions};
pub use dedup::{DedupGuard, DEDUP_KEY_PREFIX};
pub use message::{MessageCanonical, Trace, ValidationError, DATA_FIELD};
pub use publish::{AppendRetry, PublishPhase, Publisher};

use crate::config::BusConfig;
use crate::storage::{EntryId, GroupRead, StorageError, StreamStore, GROUP_START_BEGINNING};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),

    #[error("Stream store error: {0}")]
    Store(#[from] StorageError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed entry {id} on stream '{stream}': {reason}")]
    MalformedEntry {
        stream: String,
        id: EntryId,
        reason: String,
    },

    #[error("Append to '{stream}' failed after {attempts} attempt(s): {source}")]
    AppendFailed {
        stream: String,
        attempts: usize,
        #[source]
        source: StorageError,
    },
}

impl BusError {
    /// Whether the failure is about connectivity rather than the message itself.
    pub fn is_transient(&self) -> bool {
        match self {
            BusError::Store(e) => e.is_transient(),
            BusError::AppendFailed { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

// ============================================================================
// MessageBus
// ============================================================================

/// Publish/read/ack API shared by producers and consumers of one process.
pub struct MessageBus {
    store: Arc<dyn StreamStore>,
    publisher: Publisher,
    default_maxlen: Option<usize>,
    /// Group, consumer, block and count applied by [`MessageBus::read_options`].
    read_defaults: ReadOptions,
    /// (stream, group) pairs this instance has already created.
    groups: Mutex<HashSet<(String, String)>>,
}

impl MessageBus {
    pub fn new(store: Arc<dyn StreamStore>, config: &BusConfig) -> Self {
        let dedup = DedupGuard::new(store.clone(), config.dedup_ttl());
        let retry = AppendRetry {
            retries: config.append_retries,
            delay: config.append_retry_delay(),
        };
        Self {
            publisher: Publisher::new(store.clone(), dedup, retry),
            store,
            default_maxlen: config.maxlen,
            read_defaults: ReadOptions::from_config(String::new(), config),
            groups: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    /// Options for reading `stream` as this process's configured consumer.
    pub fn read_options(&self, stream: impl Into<String>) -> ReadOptions {
        ReadOptions {
            stream: stream.into(),
            ..self.read_defaults.clone()
        }
    }

    /// Publish a validated envelope.
    ///
    /// Returns the store-assigned id, or `None` if the trace id was already
    /// published within the dedup window. `maxlen` falls back to the
    /// configured cap.
    pub async fn publish(
        &self,
        stream: &str,
        message: &MessageCanonical,
        maxlen: Option<usize>,
    ) -> Result<Option<EntryId>> {
        self.publisher
            .publish(stream, message, maxlen.or(self.default_maxlen))
            .await
    }

    /// Validate an untyped envelope, then publish it.
    pub async fn publish_value(
        &self,
        stream: &str,
        message: Value,
        maxlen: Option<usize>,
    ) -> Result<Option<EntryId>> {
        let message = MessageCanonical::from_value(message)?;
        self.publish(stream, &message, maxlen).await
    }

    /// Read entries never delivered to this group.
    ///
    /// A block timeout with nothing available yields an empty list. An entry
    /// whose payload cannot be decoded fails the whole read with
    /// [`BusError::MalformedEntry`]; it stays pending for this consumer.
    pub async fn read(&self, opts: &ReadOptions) -> Result<Vec<Delivery>> {
        self.ensure_group(&opts.stream, &opts.group).await?;

        let read = GroupRead {
            stream: &opts.stream,
            group: &opts.group,
            consumer: &opts.consumer,
            count: opts.count,
            block: opts.block_timeout(),
        };

        let entries = match self.store.read_group(&read).await {
            Err(StorageError::NoGroup { .. }) => {
                // Stream or group was removed behind our back.
                self.forget_group(&opts.stream, &opts.group);
                self.ensure_group(&opts.stream, &opts.group).await?;
                self.store.read_group(&read).await?
            }
            other => other?,
        };

        consumer::decode_entries(&self.store, &opts.stream, &opts.group, entries)
    }

    /// Acknowledge an entry by id.
    pub async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool> {
        AckHandle::new(self.store.clone(), stream, group, id).ack().await
    }

    /// Take over entries another consumer left pending longer than `min_idle`.
    ///
    /// Nothing calls this automatically.
    pub async fn claim_stale(&self, opts: &ReadOptions, min_idle: Duration) -> Result<Vec<Delivery>> {
        self.ensure_group(&opts.stream, &opts.group).await?;
        let entries = self
            .store
            .claim_stale(
                &opts.stream,
                &opts.group,
                &opts.consumer,
                min_idle,
                opts.count,
            )
            .await?;
        if !entries.is_empty() {
            info!(
                stream = %opts.stream,
                group = %opts.group,
                consumer = %opts.consumer,
                claimed = entries.len(),
                "Claimed stale entries"
            );
        }
        consumer::decode_entries(&self.store, &opts.stream, &opts.group, entries)
    }

    /// Entries delivered to `group` but not yet acknowledged.
    pub async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        Ok(self.store.pending_count(stream, group).await?)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let key = (stream.to_string(), group.to_string());
        if self.lock_groups().contains(&key) {
            return Ok(());
        }
        let created = self
            .store
            .create_group(stream, group, GROUP_START_BEGINNING)
            .await?;
        if created {
            debug!(stream = %stream, group = %group, "Consumer group created");
        }
        self.lock_groups().insert(key);
        Ok(())
    }

    fn forget_group(&self, stream: &str, group: &str) {
        self.lock_groups()
            .remove(&(stream.to_string(), group.to_string()));
    }

    fn lock_groups(&self) -> std::sync::MutexGuard<'_, HashSet<(String, String)>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
