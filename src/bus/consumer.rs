//! Consumer-group reads and acknowledgement handles.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::message::{MessageCanonical, DATA_FIELD};
use super::{BusError, Result};
use crate::config::BusConfig;
use crate::storage::{EntryId, StreamEntry, StreamStore};

/// Parameters of [`MessageBus::read`](super::MessageBus::read).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOptions {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    /// How long to wait when nothing is available. Zero returns at once.
    pub block: Duration,
    pub count: usize,
}

impl ReadOptions {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            block: Duration::ZERO,
            count: 1,
        }
    }

    /// Read `stream` as this process's consumer in the configured group,
    /// with the configured block timeout and batch size.
    pub fn from_config(stream: impl Into<String>, config: &BusConfig) -> Self {
        Self::new(stream, config.group.clone(), config.consumer.clone())
            .with_block(config.block())
            .with_count(config.count)
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count.max(1);
        self
    }

    pub(crate) fn block_timeout(&self) -> Option<Duration> {
        (!self.block.is_zero()).then_some(self.block)
    }
}

/// Acknowledges one delivered entry for its group.
#[derive(Clone)]
pub struct AckHandle {
    store: Arc<dyn StreamStore>,
    stream: String,
    group: String,
    id: EntryId,
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle")
            .field("stream", &self.stream)
            .field("group", &self.group)
            .field("id", &self.id)
            .finish()
    }
}

impl AckHandle {
    pub(crate) fn new(store: Arc<dyn StreamStore>, stream: &str, group: &str, id: EntryId) -> Self {
        Self {
            store,
            stream: stream.to_string(),
            group: group.to_string(),
            id,
        }
    }

    /// Retire the entry from the group's pending set.
    ///
    /// Returns `false` if it was no longer pending (already acked or trimmed).
    pub async fn ack(&self) -> Result<bool> {
        let n = self.store.ack(&self.stream, &self.group, &[self.id]).await?;
        debug!(stream = %self.stream, group = %self.group, entry_id = %self.id, acked = n, "Acked");
        Ok(n > 0)
    }
}

/// One delivered message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: EntryId,
    pub message: MessageCanonical,
    ack: AckHandle,
}

impl Delivery {
    pub async fn ack(&self) -> Result<bool> {
        self.ack.ack().await
    }

    pub fn ack_handle(&self) -> AckHandle {
        self.ack.clone()
    }
}

/// Decode raw entries; the first unparseable one fails the batch.
pub(crate) fn decode_entries(
    store: &Arc<dyn StreamStore>,
    stream: &str,
    group: &str,
    entries: Vec<StreamEntry>,
) -> Result<Vec<Delivery>> {
    entries
        .into_iter()
        .map(|entry| {
            let data = entry
                .field(DATA_FIELD)
                .ok_or_else(|| BusError::MalformedEntry {
                    stream: stream.to_string(),
                    id: entry.id,
                    reason: format!("missing '{DATA_FIELD}' field"),
                })?;
            let message =
                MessageCanonical::decode(data).map_err(|reason| BusError::MalformedEntry {
                    stream: stream.to_string(),
                    id: entry.id,
                    reason,
                })?;
            Ok(Delivery {
                id: entry.id,
                message,
                ack: AckHandle::new(store.clone(), stream, group, entry.id),
            })
        })
        .collect()
}
