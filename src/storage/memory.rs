//! In-memory stream store.
//!
//! Mirrors the Redis Streams semantics the bus relies on: store-assigned
//! monotonically increasing ids, consumer groups with a last-delivered cursor
//! and a pending entry list, TTL keys, and blocking reads woken by appends.
//! Ideal for local development and testing without external dependencies.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{
    EntryId, GroupRead, Result, StorageError, StreamEntry, StreamStore, GROUP_START_LATEST,
};
use crate::utils::clock::{system_clock, Clock};

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at_ms: u64,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamLog {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, StreamLog>,
    /// Key -> expiry (unix ms). Values are sentinels and never read back.
    keys: HashMap<String, u64>,
    /// Expiry (unix ms) -> keys set with that expiry, drained as time passes.
    expiries: BTreeMap<u64, Vec<String>>,
}

impl State {
    /// Drop every key whose expiry is at or before `now`.
    fn expire_keys(&mut self, now: u64) {
        let live = self.expiries.split_off(&now.saturating_add(1));
        let due = std::mem::replace(&mut self.expiries, live);
        for (expires_at, keys) in due {
            for key in keys {
                // A key re-set later carries a newer expiry and stays.
                if self.keys.get(&key) == Some(&expires_at) {
                    self.keys.remove(&key);
                }
            }
        }
    }
}

/// In-process stream store.
///
/// All commands run under one lock, which is never held across an await.
pub struct MemoryStreamStore {
    state: Mutex<State>,
    appended: Notify,
    clock: Arc<dyn Clock>,
    connected: AtomicBool,
    closed: AtomicBool,
    fail_appends: AtomicUsize,
    set_if_absent_calls: AtomicU64,
}

impl MemoryStreamStore {
    /// Create a store that reads time from the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create a store whose ids and TTLs follow the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            clock,
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            fail_appends: AtomicUsize::new(0),
            set_if_absent_calls: AtomicU64::new(0),
        }
    }

    /// Simulate the connection going down (`false`) or coming back (`true`).
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make the next `n` appends fail with a connectivity error.
    pub fn fail_next_appends(&self, n: usize) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    /// How many set-if-absent commands have been issued.
    pub fn set_if_absent_calls(&self) -> u64 {
        self.set_if_absent_calls.load(Ordering::SeqCst)
    }

    /// Number of entries currently held in `stream`.
    pub fn len(&self, stream: &str) -> usize {
        self.lock()
            .streams
            .get(stream)
            .map(|log| log.entries.len())
            .unwrap_or(0)
    }

    /// Whether `stream` holds no entries.
    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Number of TTL keys not yet pruned.
    pub fn key_count(&self) -> usize {
        self.lock().keys.len()
    }

    /// Owner and delivery count of a pending entry.
    pub fn pending_owner(&self, stream: &str, group: &str, id: EntryId) -> Option<(String, u32)> {
        self.lock()
            .streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .and_then(|g| g.pending.get(&id))
            .map(|p| (p.consumer.clone(), p.deliveries))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StorageError::Disconnected);
        }
        Ok(())
    }

    /// Deliver never-delivered entries under the lock.
    fn deliver_new(&self, read: &GroupRead<'_>) -> Result<Vec<StreamEntry>> {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let log = state
            .streams
            .get_mut(read.stream)
            .ok_or_else(|| no_group(read.stream, read.group))?;
        let group = log
            .groups
            .get_mut(read.group)
            .ok_or_else(|| no_group(read.stream, read.group))?;

        let batch: Vec<StreamEntry> = log
            .entries
            .range(group.last_delivered.next()..)
            .take(read.count.max(1))
            .map(|(id, fields)| StreamEntry {
                id: *id,
                fields: fields.clone(),
            })
            .collect();

        for entry in &batch {
            group.pending.insert(
                entry.id,
                PendingEntry {
                    consumer: read.consumer.to_string(),
                    delivered_at_ms: now,
                    deliveries: 1,
                },
            );
            group.last_delivered = entry.id;
        }

        Ok(batch)
    }
}

impl Default for MemoryStreamStore {
    fn default() -> Self {
        Self::new()
    }
}

fn no_group(stream: &str, group: &str) -> StorageError {
    StorageError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn set_if_absent(&self, key: &str, _value: &str, ttl: Duration) -> Result<bool> {
        self.check_open()?;
        self.set_if_absent_calls.fetch_add(1, Ordering::SeqCst);

        let now = self.clock.now_ms();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let mut state = self.lock();
        state.expire_keys(now);

        if state.keys.contains_key(key) {
            return Ok(false);
        }

        let expires_at = now.saturating_add(ttl_ms);
        state.keys.insert(key.to_string(), expires_at);
        state
            .expiries
            .entry(expires_at)
            .or_default()
            .push(key.to_string());
        Ok(true)
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        maxlen: Option<usize>,
    ) -> Result<EntryId> {
        self.check_open()?;
        if self
            .fail_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::Disconnected);
        }

        let now = self.clock.now_ms();
        let id = {
            let mut state = self.lock();
            let log = state.streams.entry(stream.to_string()).or_default();

            let id = if now > log.last_id.ms {
                EntryId::new(now, 0)
            } else {
                log.last_id.next()
            };
            log.last_id = id;
            log.entries.insert(
                id,
                fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );

            if let Some(max) = maxlen {
                while log.entries.len() > max {
                    log.entries.pop_first();
                }
            }
            id
        };

        self.appended.notify_waiters();
        debug!(stream = %stream, entry_id = %id, "Appended entry");
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str, start: &str) -> Result<bool> {
        self.check_open()?;
        let mut state = self.lock();
        let log = state.streams.entry(stream.to_string()).or_default();

        if log.groups.contains_key(group) {
            return Ok(false);
        }

        let last_delivered = if start == GROUP_START_LATEST {
            log.last_id
        } else {
            start.parse()?
        };
        log.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(true)
    }

    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<StreamEntry>> {
        let deadline = read
            .block
            .filter(|d| !d.is_zero())
            .map(|d| tokio::time::Instant::now() + d);

        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_open()?;
            let batch = self.deliver_new(read)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let Some(deadline) = deadline else {
                return Ok(batch);
            };
            if tokio::time::Instant::now() >= deadline {
                return Ok(batch);
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        self.check_open()?;
        let mut state = self.lock();
        let Some(group) = state
            .streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
        else {
            return Ok(0);
        };

        let acked = ids
            .iter()
            .filter(|id| group.pending.remove(id).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        self.check_open()?;
        let state = self.lock();
        state
            .streams
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .ok_or_else(|| no_group(stream, group))
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        self.check_open()?;
        let now = self.clock.now_ms();
        let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);

        let mut state = self.lock();
        let log = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let StreamLog {
            entries, groups, ..
        } = log;
        let group_state = groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let stale: Vec<EntryId> = group_state
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.delivered_at_ms) >= min_idle_ms)
            .map(|(id, _)| *id)
            .take(count.max(1))
            .collect();

        let mut claimed = Vec::with_capacity(stale.len());
        for id in stale {
            match entries.get(&id) {
                Some(fields) => {
                    if let Some(p) = group_state.pending.get_mut(&id) {
                        p.consumer = consumer.to_string();
                        p.delivered_at_ms = now;
                        p.deliveries = p.deliveries.saturating_add(1);
                    }
                    claimed.push(StreamEntry {
                        id,
                        fields: fields.clone(),
                    });
                }
                None => {
                    // Trimmed out of the stream; nothing left to redeliver.
                    group_state.pending.remove(&id);
                }
            }
        }

        Ok(claimed)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.appended.notify_waiters();
            info!(backend = "memory", "Stream store closed");
        }
    }
}
