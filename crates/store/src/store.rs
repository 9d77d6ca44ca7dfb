// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `Store`: the single async handle every agent uses to talk to the shared
//! key/value store (`spec.md` §3, §6).
//!
//! Grounded on `pcredis.py`'s `PCRedis` wrapper (store/read/publish/listen/
//! create_ts_keys) and, for the connection/task-loop shape, on this
//! workspace's other transport code (`CancellationToken`-gated
//! `tokio::select!` loops, `tracing` spans on connect).

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// Current wall-clock time in milliseconds since the Unix epoch, the same
/// timestamp convention the store's timeseries commands use.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The result of reading a single key: either a plain value or the most
/// recent sample of a timeseries key (`spec.md` §3 store read).
#[derive(Debug, Clone, PartialEq)]
pub enum ReadValue {
    Plain(String),
    Timeseries { timestamp_ms: i64, value: f64 },
}

/// A message delivered to a `listen` subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub channel: String,
    pub payload: String,
}

/// Async handle to the Redis-compatible store.
///
/// Cloning a `Store` is cheap: the connection manager and declared-key set
/// are shared, matching `redis::aio::ConnectionManager`'s own internal
/// reconnect-and-share design.
#[derive(Clone)]
pub struct Store {
    client: redis::Client,
    conn: ConnectionManager,
    declared_ts: Arc<RwLock<HashSet<String>>>,
}

impl Store {
    /// Connect to the store at `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        info!(url, "connecting to store");
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!("store connection established");
        Ok(Self { client, conn, declared_ts: Arc::new(RwLock::new(HashSet::new())) })
    }

    /// Write plain key/value pairs, each followed by a publish on the key
    /// itself as channel (`spec.md` §3 store write / §4.5: `set(key, value)`
    /// followed by `publish(key, value)`; `pcredis.py`'s `store()` does the
    /// same for every key in its non-timeseries branch).
    pub async fn store(&self, pairs: &[(&str, &str)]) -> Result<(), StoreError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (k, v) in pairs {
            pipe.set(*k, *v);
            pipe.publish(*k, *v);
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Append a timeseries sample with an auto-assigned timestamp
    /// (`spec.md` §6 `add(key, value, timestamp=auto)`), returning the
    /// timestamp Redis assigned. The key must have been declared via
    /// `create_ts` first (`spec.md` §3 invariant: undeclared timeseries
    /// writes fail rather than silently autocreating).
    pub async fn store_ts(&self, key: &str, value: f64) -> Result<i64, StoreError> {
        if !self.declared_ts.read().await.contains(key) {
            return Err(StoreError::UndeclaredTimeseries(key.to_owned()));
        }
        let mut conn = self.conn.clone();
        let timestamp_ms: i64 = redis::cmd("TS.ADD")
            .arg(key)
            .arg("*")
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(timestamp_ms)
    }

    /// Read a timeseries' samples within `[from_ms, to_ms]` inclusive
    /// (`spec.md` §6 timeseries `range`).
    pub async fn range(&self, key: &str, from_ms: i64, to_ms: i64) -> Result<Vec<(i64, f64)>, StoreError> {
        let mut conn = self.conn.clone();
        let samples: Vec<(i64, f64)> = redis::cmd("TS.RANGE")
            .arg(key)
            .arg(from_ms)
            .arg(to_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::MalformedTimeseries { key: key.to_owned(), detail: e.to_string() })?;
        Ok(samples)
    }

    /// Idempotently declare a set of timeseries keys, creating any that do
    /// not already exist (`pcredis.py`'s `create_ts_keys`).
    pub async fn create_ts(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        for key in keys {
            let exists: bool = conn.exists(*key).await?;
            if !exists {
                let created = redis::cmd("TS.CREATE")
                    .arg(*key)
                    .arg("DUPLICATE_POLICY")
                    .arg("LAST")
                    .query_async::<()>(&mut conn)
                    .await;
                if let Err(e) = created {
                    warn!(key = *key, err = %e, "TS.CREATE failed, key may already exist concurrently");
                }
            }
            self.declared_ts.write().await.insert((*key).to_owned());
        }
        Ok(())
    }

    /// Read a set of keys, resolving each to a plain value or the latest
    /// timeseries sample. If `error_missing` is set, a missing key returns
    /// `StoreError::Missing` instead of being skipped.
    pub async fn read(&self, keys: &[&str], error_missing: bool) -> Result<Vec<(String, ReadValue)>, StoreError> {
        let mut conn = self.conn.clone();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if self.declared_ts.read().await.contains(*key) {
                let resp: Option<(i64, f64)> = redis::cmd("TS.GET")
                    .arg(*key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| StoreError::MalformedTimeseries { key: (*key).to_owned(), detail: e.to_string() })?;
                match resp {
                    Some((ts, val)) => out.push((
                        (*key).to_owned(),
                        ReadValue::Timeseries { timestamp_ms: ts, value: val },
                    )),
                    None if error_missing => return Err(StoreError::Missing((*key).to_owned())),
                    None => {}
                }
                continue;
            }

            let val: Option<String> = conn.get(*key).await?;
            match val {
                Some(v) => out.push(((*key).to_owned(), ReadValue::Plain(v))),
                None if error_missing => return Err(StoreError::Missing((*key).to_owned())),
                None => {}
            }
        }
        Ok(out)
    }

    /// Publish a value to a pub/sub channel, optionally also persisting it
    /// as a plain key (`spec.md` §3 "write-through" publish).
    pub async fn publish(&self, channel: &str, payload: &str, also_store_at: Option<&str>) -> Result<(), StoreError> {
        if let Some(key) = also_store_at {
            self.store(&[(key, payload)]).await?;
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    /// Subscribe to a set of channels, returning a stream of deliveries.
    /// Mirrors `pcredis.py`'s `listen` generator: a dedicated `redis::aio::PubSub`
    /// connection (Redis subscriptions occupy a connection exclusively, so the
    /// shared `ConnectionManager` can't be reused here) feeding a broadcast
    /// channel, the same subscriber-loop shape used elsewhere in this
    /// workspace.
    pub async fn listen(&self, channels: Vec<String>) -> Result<impl futures_util::Stream<Item = Delivery>, StoreError> {
        let (tx, rx) = broadcast::channel::<Delivery>(256);
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in &channels {
            pubsub.subscribe(channel).await?;
        }
        tokio::spawn(async move {
            debug!(?channels, "pubsub listener starting");
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel: String = msg.get_channel_name().to_owned();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(err = %e, "pubsub payload not valid UTF-8");
                        continue;
                    }
                };
                if tx.send(Delivery { channel, payload }).is_err() {
                    break;
                }
            }
            debug!("pubsub listener exited");
        });
        Ok(BroadcastStream::new(rx).filter_map(|r| async move { r.ok() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_value_distinguishes_plain_and_timeseries() {
        let plain = ReadValue::Plain("42".to_owned());
        let ts = ReadValue::Timeseries { timestamp_ms: 1000, value: 0.5 };
        assert_ne!(plain, ts);
    }
}
