//! Trace-id deduplication on top of the stream store.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::storage::{Result, StreamStore};

/// Prefix of dedup keys; the full key is `bus:trace:<trace_id>`.
pub const DEDUP_KEY_PREFIX: &str = "bus:trace:";

const SENTINEL: &str = "1";

/// Atomic first-writer-wins reservation of a trace id.
///
/// Keys are never deleted; they expire after the configured TTL.
#[derive(Clone)]
pub struct DedupGuard {
    store: Arc<dyn StreamStore>,
    ttl: Duration,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn StreamStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn key(trace_id: &str) -> String {
        format!("{DEDUP_KEY_PREFIX}{trace_id}")
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Reserve `trace_id`. Returns `false` if it was already reserved within the TTL.
    pub async fn reserve(&self, trace_id: &str) -> Result<bool> {
        let key = Self::key(trace_id);
        let fresh = self.store.set_if_absent(&key, SENTINEL, self.ttl).await?;
        if !fresh {
            debug!(trace_id = %trace_id, "Trace id already reserved");
        }
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStreamStore;
    use crate::utils::clock::ManualClock;

    #[test]
    fn test_key_format() {
        assert_eq!(DedupGuard::key("abc"), "bus:trace:abc");
    }

    #[tokio::test]
    async fn test_reserve_once_per_window() {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStreamStore::with_clock(clock.clone()));
        let guard = DedupGuard::new(store.clone(), Duration::from_millis(60_000));

        assert!(guard.reserve("t1").await.unwrap());
        assert!(!guard.reserve("t1").await.unwrap());

        clock.advance(Duration::from_millis(60_000));
        assert!(guard.reserve("t1").await.unwrap());
        assert_eq!(store.set_if_absent_calls(), 3);
    }
}
