//! Two-phase publish: reserve the trace id, then append.
//!
//! ```text
//! Unreserved ──reserve──> Reserved ──append──> Appended
//!     │                      │
//!     ├──already held──> Duplicate
//!     └──store error──>  Failed <──append retries exhausted
//! ```
//!
//! Retries re-enter `Reserved` only, so a retried append is never mistaken
//! for a duplicate of itself.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tracing::{debug, error, warn};

use super::dedup::DedupGuard;
use super::message::{MessageCanonical, DATA_FIELD};
use super::{BusError, Result};
use crate::storage::{EntryId, StorageError, StreamStore};
use crate::utils::retry::append_backoff;

/// Progress of a single publish.
#[derive(Debug)]
pub enum PublishPhase {
    /// Validated, nothing written yet.
    Unreserved,
    /// Trace id held (or no trace id); the entry is not yet in the stream.
    Reserved,
    /// Entry stored under this id.
    Appended(EntryId),
    /// Trace id was already held; nothing appended.
    Duplicate,
    /// Gave up. The reservation, if any, is left to expire.
    Failed(BusError),
}

impl PublishPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PublishPhase::Appended(_) | PublishPhase::Duplicate | PublishPhase::Failed(_)
        )
    }
}

/// Append retry policy.
#[derive(Debug, Clone, Copy)]
pub struct AppendRetry {
    /// Extra attempts after the first.
    pub retries: usize,
    pub delay: Duration,
}

impl Default for AppendRetry {
    fn default() -> Self {
        Self {
            retries: 1,
            delay: Duration::from_millis(50),
        }
    }
}

/// Drives [`PublishPhase`] transitions against the store.
#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn StreamStore>,
    dedup: DedupGuard,
    retry: AppendRetry,
}

impl Publisher {
    pub fn new(store: Arc<dyn StreamStore>, dedup: DedupGuard, retry: AppendRetry) -> Self {
        Self {
            store,
            dedup,
            retry,
        }
    }

    /// Publish `message` to `stream`.
    ///
    /// Returns `None` when the trace id was already published within the
    /// dedup window.
    pub async fn publish(
        &self,
        stream: &str,
        message: &MessageCanonical,
        maxlen: Option<usize>,
    ) -> Result<Option<EntryId>> {
        // Nothing is written until the envelope is known good.
        message.validate()?;
        let data = message.encode()?;

        let mut phase = PublishPhase::Unreserved;
        loop {
            phase = match phase {
                PublishPhase::Unreserved => self.reserve(message).await,
                PublishPhase::Reserved => self.append(stream, &data, maxlen).await,
                PublishPhase::Appended(id) => {
                    debug!(stream = %stream, entry_id = %id, trace_id = ?message.trace_id(), "Published");
                    return Ok(Some(id));
                }
                PublishPhase::Duplicate => {
                    debug!(stream = %stream, trace_id = ?message.trace_id(), "Duplicate dropped");
                    return Ok(None);
                }
                PublishPhase::Failed(e) => {
                    error!(stream = %stream, error = %e, "Publish failed");
                    return Err(e);
                }
            };
        }
    }

    async fn reserve(&self, message: &MessageCanonical) -> PublishPhase {
        let Some(trace_id) = message.trace_id() else {
            return PublishPhase::Reserved;
        };
        match self.dedup.reserve(trace_id).await {
            Ok(true) => PublishPhase::Reserved,
            Ok(false) => PublishPhase::Duplicate,
            Err(e) => PublishPhase::Failed(BusError::Store(e)),
        }
    }

    async fn append(&self, stream: &str, data: &str, maxlen: Option<usize>) -> PublishPhase {
        let attempts = AtomicUsize::new(0);
        let fields = [(DATA_FIELD, data)];

        let result = (|| async {
            attempts.fetch_add(1, Ordering::Relaxed);
            self.store.append(stream, &fields, maxlen).await
        })
        .retry(append_backoff(self.retry.delay, self.retry.retries))
        .when(StorageError::is_transient)
        .notify(|err: &StorageError, dur: Duration| {
            warn!(stream = %stream, error = %err, delay = ?dur, "Append failed, retrying");
        })
        .await;

        match result {
            Ok(id) => PublishPhase::Appended(id),
            Err(source) => PublishPhase::Failed(BusError::AppendFailed {
                stream: stream.to_string(),
                attempts: attempts.load(Ordering::Relaxed),
                source,
            }),
        }
    }
}
