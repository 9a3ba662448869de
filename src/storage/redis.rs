//! Redis Streams stream store.
//!
//! Commands map one-to-one onto Redis:
//! `SET NX PX`, `XADD`, `XGROUP CREATE`, `XREADGROUP`, `XACK`, `XPENDING`, `XAUTOCLAIM`.
//!
//! Ordinary commands share one multiplexed connection. Redis serves a
//! connection's commands in order, so every blocking `XREADGROUP ... BLOCK`
//! checks out a connection of its own from a small idle pool: a consumer
//! parked on an empty stream never stalls publishes, nor another blocking
//! reader in the same process.
//!
//! When the command connection drops, its slot is emptied and a background
//! task reconnects with linear backoff. Until then, commands fail with
//! [`StorageError::Disconnected`] instead of being queued. A blocking-read
//! connection that fails is discarded; the next read opens a fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, FromRedisValue, RedisError, Value};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use super::{EntryId, GroupRead, Result, StorageError, StreamEntry, StreamStore};
use crate::config::StoreConfig;
use crate::utils::retry::LinearBackoff;

/// Idle blocking-read connections kept for reuse.
const MAX_IDLE_BLOCKING: usize = 8;

struct Inner {
    client: Client,
    commands: RwLock<Option<MultiplexedConnection>>,
    reconnecting: AtomicBool,
    /// Connections not currently serving a blocking read.
    blocking_idle: Mutex<Vec<MultiplexedConnection>>,
    reconnect_step: Duration,
    reconnect_max: Duration,
    closed: AtomicBool,
    /// Wakes in-flight commands (blocked reads included) on close.
    shutdown: Notify,
}

impl Inner {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<MultiplexedConnection>> {
        self.blocking_idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Redis-backed stream store.
pub struct RedisStreamStore {
    inner: Arc<Inner>,
}

impl RedisStreamStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `config` - Connection URL and reconnect schedule
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let commands = client.get_multiplexed_async_connection().await?;

        info!(url = %config.url, "Connected to Redis");

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                commands: RwLock::new(Some(commands)),
                reconnecting: AtomicBool::new(false),
                blocking_idle: Mutex::new(Vec::new()),
                reconnect_step: Duration::from_millis(config.reconnect_step_ms),
                reconnect_max: Duration::from_millis(config.reconnect_max_ms),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        self.inner
            .commands
            .read()
            .await
            .clone()
            .ok_or(StorageError::Disconnected)
    }

    /// Run one command on the shared connection.
    ///
    /// Closing the store aborts the command with [`StorageError::Closed`].
    async fn run<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let shutdown = self.inner.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        let mut conn = self.connection().await?;
        let result: std::result::Result<T, RedisError> = tokio::select! {
            result = cmd.query_async(&mut conn) => result,
            _ = &mut shutdown => return Err(StorageError::Closed),
        };
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if is_connection_error(&e) {
                    self.mark_down(&e).await;
                }
                Err(e.into())
            }
        }
    }

    /// Run one blocking command on a connection it holds alone.
    async fn run_blocking<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let shutdown = self.inner.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();

        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }

        let idle = self.inner.idle().pop();
        let mut conn = match idle {
            Some(conn) => conn,
            None => {
                let opened = tokio::select! {
                    opened = self.inner.client.get_multiplexed_async_connection() => opened,
                    _ = &mut shutdown => return Err(StorageError::Closed),
                };
                opened.map_err(|e| {
                    if is_connection_error(&e) {
                        warn!(error = %e, "Could not open blocking-read connection");
                        StorageError::Disconnected
                    } else {
                        e.into()
                    }
                })?
            }
        };

        let result: std::result::Result<T, RedisError> = tokio::select! {
            result = cmd.query_async(&mut conn) => result,
            _ = &mut shutdown => return Err(StorageError::Closed),
        };
        match result {
            Ok(value) => {
                self.release_blocking(conn);
                Ok(value)
            }
            Err(e) => {
                if !is_connection_error(&e) {
                    self.release_blocking(conn);
                }
                Err(e.into())
            }
        }
    }

    fn release_blocking(&self, conn: MultiplexedConnection) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut idle = self.inner.idle();
        if idle.len() < MAX_IDLE_BLOCKING {
            idle.push(conn);
        }
    }

    /// Number of blocking-read connections waiting for reuse.
    pub fn idle_blocking_connections(&self) -> usize {
        self.inner.idle().len()
    }

    async fn mark_down(&self, cause: &RedisError) {
        self.inner.commands.write().await.take();

        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(error = %cause, "Redis connection lost, reconnecting");
        tokio::spawn(reconnect(self.inner.clone()));
    }
}

/// Re-establish the command connection with linear backoff.
async fn reconnect(inner: Arc<Inner>) {
    let mut backoff = LinearBackoff::new(inner.reconnect_step, inner.reconnect_max);
    let mut attempt: u32 = 0;

    loop {
        let delay = backoff.next().unwrap_or(inner.reconnect_max);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;

        if inner.closed.load(Ordering::SeqCst) {
            break;
        }

        match inner.client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                *inner.commands.write().await = Some(conn);
                info!(attempt, "Reconnected to Redis");
                break;
            }
            Err(e) => {
                warn!(attempt, delay = ?delay, error = %e, "Redis reconnect failed");
            }
        }
    }

    inner.reconnecting.store(false, Ordering::SeqCst);
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
}

fn map_group_error(e: StorageError, stream: &str, group: &str) -> StorageError {
    let is_no_group = matches!(&e, StorageError::Redis(re) if re.code() == Some("NOGROUP"));
    if is_no_group {
        return StorageError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
    }
    e
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Reply parsing
// ============================================================================

fn unexpected(what: &str, value: &Value) -> StorageError {
    StorageError::Protocol(format!("expected {}, got {:?}", what, value))
}

/// Parse a field list: `[k1, v1, k2, v2, ...]` (RESP2) or a map (RESP3).
fn parse_fields(value: &Value) -> Result<HashMap<String, String>> {
    match value {
        // Entry deleted or trimmed while still pending.
        Value::Nil => Ok(HashMap::new()),
        Value::Array(items) => {
            if items.len() % 2 != 0 {
                return Err(unexpected("even-length field list", value));
            }
            items
                .chunks_exact(2)
                .map(|kv| -> Result<(String, String)> {
                    Ok((
                        redis::from_redis_value::<String>(&kv[0])?,
                        redis::from_redis_value::<String>(&kv[1])?,
                    ))
                })
                .collect()
        }
        Value::Map(pairs) => pairs
            .iter()
            .map(|(k, v)| -> Result<(String, String)> {
                Ok((
                    redis::from_redis_value::<String>(k)?,
                    redis::from_redis_value::<String>(v)?,
                ))
            })
            .collect(),
        other => Err(unexpected("field list", other)),
    }
}

/// Parse `[[id, fields], ...]`.
fn parse_entries(value: &Value) -> Result<Vec<StreamEntry>> {
    let items = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(items) => items,
        other => return Err(unexpected("entry list", other)),
    };

    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Nil => continue,
            Value::Array(parts) => {
                let [id, fields] = parts.as_slice() else {
                    return Err(unexpected("[id, fields]", item));
                };
                let id: String = redis::from_redis_value(id)?;
                entries.push(StreamEntry {
                    id: id.parse()?,
                    fields: parse_fields(fields)?,
                });
            }
            other => return Err(unexpected("entry", other)),
        }
    }
    Ok(entries)
}

/// Parse an `XREADGROUP` reply: nil on timeout, else `[[stream, entries], ...]`.
fn parse_read_reply(value: &Value) -> Result<Vec<StreamEntry>> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Array(streams) => {
            let mut entries = Vec::new();
            for stream in streams {
                let Value::Array(pair) = stream else {
                    return Err(unexpected("[stream, entries]", stream));
                };
                let [_name, items] = pair.as_slice() else {
                    return Err(unexpected("[stream, entries]", stream));
                };
                entries.extend(parse_entries(items)?);
            }
            Ok(entries)
        }
        Value::Map(streams) => {
            let mut entries = Vec::new();
            for (_name, items) in streams {
                entries.extend(parse_entries(items)?);
            }
            Ok(entries)
        }
        other => Err(unexpected("stream reply", other)),
    }
}

/// Parse an `XAUTOCLAIM` reply: `[cursor, entries]` or `[cursor, entries, deleted]`.
fn parse_autoclaim_reply(value: &Value) -> Result<Vec<StreamEntry>> {
    match value {
        Value::Array(parts) if parts.len() >= 2 => parse_entries(&parts[1]),
        other => Err(unexpected("[cursor, entries, ...]", other)),
    }
}

/// Parse the summary form of `XPENDING`: `[count, min, max, consumers]`.
fn parse_pending_summary(value: &Value) -> Result<u64> {
    match value {
        Value::Array(parts) => match parts.first() {
            Some(count) => Ok(redis::from_redis_value(count)?),
            None => Err(unexpected("pending summary", value)),
        },
        other => Err(unexpected("pending summary", other)),
    }
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(millis(ttl));

        let reply: Option<String> = self.run(&cmd).await?;
        Ok(reply.is_some())
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        maxlen: Option<usize>,
    ) -> Result<EntryId> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max) = maxlen {
            cmd.arg("MAXLEN").arg("~").arg(max);
        }
        cmd.arg("*");
        for (k, v) in fields {
            cmd.arg(*k).arg(*v);
        }

        let id: String = self.run(&cmd).await?;
        let id = id.parse()?;
        debug!(stream = %stream, entry_id = %id, "Appended entry");
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str, start: &str) -> Result<bool> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg(start).arg("MKSTREAM");

        match self.run::<Value>(&cmd).await {
            Ok(_) => {
                info!(stream = %stream, group = %group, "Created consumer group");
                Ok(true)
            }
            Err(StorageError::Redis(e)) if e.code() == Some("BUSYGROUP") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read_group(&self, read: &GroupRead<'_>) -> Result<Vec<StreamEntry>> {
        let block = read.block.filter(|d| !d.is_zero());

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(read.group)
            .arg(read.consumer)
            .arg("COUNT")
            .arg(read.count.max(1));
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(millis(block));
        }
        cmd.arg("STREAMS").arg(read.stream).arg(">");

        let reply = if block.is_some() {
            self.run_blocking::<Value>(&cmd).await
        } else {
            self.run::<Value>(&cmd).await
        };
        let reply = reply.map_err(|e| map_group_error(e, read.stream, read.group))?;
        parse_read_reply(&reply)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id.to_string());
        }
        self.run(&cmd).await
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let mut cmd = redis::cmd("XPENDING");
        cmd.arg(stream).arg(group);

        let reply: Value = self
            .run(&cmd)
            .await
            .map_err(|e| map_group_error(e, stream, group))?;
        parse_pending_summary(&reply)
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(millis(min_idle))
            .arg("0-0")
            .arg("COUNT")
            .arg(count.max(1));

        let reply: Value = self
            .run(&cmd)
            .await
            .map_err(|e| map_group_error(e, stream, group))?;
        parse_autoclaim_reply(&reply)
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_waiters();
        // Dropping a multiplexed connection shuts its driver task down.
        self.inner.commands.write().await.take();
        self.inner.idle().clear();
        info!(backend = "redis", "Stream store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    fn entry(id: &str, fields: &[(&str, &str)]) -> Value {
        Value::Array(vec![
            bulk(id),
            Value::Array(
                fields
                    .iter()
                    .flat_map(|(k, v)| [bulk(k), bulk(v)])
                    .collect(),
            ),
        ])
    }

    #[test]
    fn test_parse_read_reply_nil_is_empty() {
        assert!(parse_read_reply(&Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn test_parse_read_reply_entries() {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("omni.messages"),
            Value::Array(vec![
                entry("1-0", &[("data", "{\"payload\":1}")]),
                entry("1-1", &[("data", "{\"payload\":2}")]),
            ]),
        ])]);

        let entries = parse_read_reply(&reply).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, EntryId::new(1, 0));
        assert_eq!(entries[1].field("data"), Some("{\"payload\":2}"));
    }

    #[test]
    fn test_parse_entries_tolerates_deleted_fields() {
        let reply = Value::Array(vec![Value::Array(vec![bulk("5-0"), Value::Nil])]);
        let entries = parse_entries(&reply).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].fields.is_empty());
    }

    #[test]
    fn test_parse_fields_rejects_odd_list() {
        let odd = Value::Array(vec![bulk("data")]);
        assert!(matches!(parse_fields(&odd), Err(StorageError::Protocol(_))));
    }

    #[test]
    fn test_parse_autoclaim_reply_with_deleted_ids() {
        let reply = Value::Array(vec![
            bulk("0-0"),
            Value::Array(vec![entry("9-0", &[("data", "x")])]),
            Value::Array(vec![bulk("8-0")]),
        ]);
        let entries = parse_autoclaim_reply(&reply).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, EntryId::new(9, 0));
    }

    #[test]
    fn test_parse_pending_summary() {
        let reply = Value::Array(vec![Value::Int(3), bulk("1-0"), bulk("1-2"), Value::Nil]);
        assert_eq!(parse_pending_summary(&reply).unwrap(), 3);
    }
}
