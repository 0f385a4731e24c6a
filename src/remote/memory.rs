// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process [`RemoteClient`] for tests and demos.
//!
//! Tables are plain vectors of JSON rows. Failures can be injected per
//! operation, the whole backend can be switched offline, and realtime events are
//! pushed to matching subscribers with [`MemoryRemote::emit`].
//!
//! Like a real table with a `default now()` column, every row gets a
//! [`SERVER_STAMP_COLUMN`] value on first write unless it already carries one.
//! Stamps have millisecond resolution and strictly increase.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::traits::{
    compare_values, ChangeEvent, ChannelHandle, ClientError, Filter, Order, RemoteClient, Subscription,
    SERVER_STAMP_COLUMN,
};
use crate::entity::format_timestamp;

const CHANNEL_BUFFER: usize = 64;

/// Operations that can be counted or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Insert,
    Upsert,
    Delete,
    Select,
    Subscribe,
}

struct Subscriber {
    channel_id: String,
    table: String,
    filter: Filter,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    failures: Mutex<HashMap<RemoteOp, VecDeque<ClientError>>>,
    offline: AtomicBool,
    latency: Mutex<Option<Duration>>,
    calls: DashMap<RemoteOp, u64>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_channel: AtomicU64,
    closed_channels: AtomicU64,
    last_stamp_ms: AtomicI64,
}

#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

impl MemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a table's rows.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.inner.tables.lock().get(table).cloned().unwrap_or_default()
    }

    /// Append rows directly, bypassing failure injection and call counting.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        let rows: Vec<Value> = rows.into_iter().map(|row| self.stamped(row, None)).collect();
        self.inner
            .tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// `row` with its server stamp: the one it carries, else `previous`, else a fresh one.
    fn stamped(&self, mut row: Value, previous: Option<&Value>) -> Value {
        if let Some(fields) = row.as_object_mut() {
            match fields.get(SERVER_STAMP_COLUMN).and_then(Value::as_str) {
                // Later fresh stamps must sort after one supplied by hand.
                Some(given) => {
                    if let Ok(at) = DateTime::parse_from_rfc3339(given) {
                        self.inner.last_stamp_ms.fetch_max(at.timestamp_millis(), Ordering::SeqCst);
                    }
                }
                None => {
                    let stamp = previous.cloned().unwrap_or_else(|| self.next_stamp());
                    fields.insert(SERVER_STAMP_COLUMN.to_string(), stamp);
                }
            }
        }
        row
    }

    fn next_stamp(&self) -> Value {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .inner
            .last_stamp_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        let ms = now.max(previous + 1);
        let at = DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now);
        json!(format_timestamp(at))
    }

    /// Fail the next call of `op` with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: RemoteOp, error: ClientError) {
        self.fail_times(op, 1, error);
    }

    pub fn fail_times(&self, op: RemoteOp, times: usize, error: ClientError) {
        let mut failures = self.inner.failures.lock();
        let queue = failures.entry(op).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// While offline every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.inner.latency.lock() = latency;
    }

    /// Number of calls made for `op`, including failed ones.
    #[must_use]
    pub fn calls(&self, op: RemoteOp) -> u64 {
        self.inner.calls.get(&op).map_or(0, |c| *c)
    }

    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    #[must_use]
    pub fn closed_channels(&self) -> u64 {
        self.inner.closed_channels.load(Ordering::SeqCst)
    }

    /// Deliver a change to every open channel on `event.table` whose filter
    /// matches the record. Returns how many channels received it.
    pub async fn emit(&self, event: ChangeEvent) -> usize {
        let targets: Vec<mpsc::Sender<ChangeEvent>> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .filter(|s| s.table == event.table && s.filter.matches(&event.record))
            .map(|s| s.tx.clone())
            .collect();

        let mut delivered = 0;
        for tx in targets {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    async fn gate(&self, op: RemoteOp) -> Result<(), ClientError> {
        *self.inner.calls.entry(op).or_insert(0) += 1;

        let latency = *self.inner.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(ClientError::offline());
        }
        let injected = self.inner.failures.lock().get_mut(&op).and_then(VecDeque::pop_front);
        match injected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn insert(&self, table: &str, rows: &[Value]) -> Result<(), ClientError> {
        self.gate(RemoteOp::Insert).await?;
        self.seed(table, rows.iter().cloned());
        Ok(())
    }

    async fn upsert(&self, table: &str, rows: &[Value], conflict_key: &str) -> Result<(), ClientError> {
        self.gate(RemoteOp::Upsert).await?;
        let columns: Vec<&str> = conflict_key.split(',').map(str::trim).collect();

        let mut tables = self.inner.tables.lock();
        let existing = tables.entry(table.to_string()).or_default();
        for row in rows {
            let same_key = |other: &Value| columns.iter().all(|c| other.get(c) == row.get(c));
            match existing.iter().position(same_key) {
                Some(idx) => {
                    let previous = existing[idx].get(SERVER_STAMP_COLUMN).cloned();
                    existing[idx] = self.stamped(row.clone(), previous.as_ref());
                }
                None => existing.push(self.stamped(row.clone(), None)),
            }
        }
        Ok(())
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, ClientError> {
        self.gate(RemoteOp::Delete).await?;
        let mut tables = self.inner.tables.lock();
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !filter.matches(row));
        Ok((before - rows.len()) as u64)
    }

    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: Option<&Order>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, ClientError> {
        self.gate(RemoteOp::Select).await?;
        let mut rows: Vec<Value> = self
            .inner
            .tables
            .lock()
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();

        if let Some(order) = order {
            let by = |column: &str, a: &Value, b: &Value| match (a.get(column), b.get(column)) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(std::cmp::Ordering::Equal),
                _ => std::cmp::Ordering::Equal,
            };
            rows.sort_by(|a, b| {
                let mut ord = by(&order.column, a, b);
                if let Some(then_by) = &order.then_by {
                    ord = ord.then_with(|| by(then_by, a, b));
                }
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn subscribe(&self, table: &str, filter: &Filter) -> Result<Subscription, ClientError> {
        self.gate(RemoteOp::Subscribe).await?;
        let n = self.inner.next_channel.fetch_add(1, Ordering::SeqCst);
        let channel_id = format!("realtime:{}:{}", table, n);
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);

        self.inner.subscribers.lock().push(Subscriber {
            channel_id: channel_id.clone(),
            table: table.to_string(),
            filter: filter.clone(),
            tx,
        });
        debug!(channel = %channel_id, %filter, "Memory channel opened");

        Ok(Subscription {
            handle: Arc::new(MemoryChannel {
                id: channel_id,
                inner: Arc::clone(&self.inner),
            }),
            events: rx,
        })
    }
}

struct MemoryChannel {
    id: String,
    inner: Arc<Inner>,
}

#[async_trait]
impl ChannelHandle for MemoryChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn close(&self) {
        let mut subscribers = self.inner.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.channel_id != self.id);
        if subscribers.len() < before {
            self.inner.closed_channels.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::traits::ChangeKind;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_replaces_on_conflict_key() {
        let remote = MemoryRemote::new();
        let key = "entity_type,entity_id";

        remote
            .upsert("t", &[json!({"entity_type": "post", "entity_id": "1", "v": 1})], key)
            .await
            .unwrap();
        remote
            .upsert("t", &[json!({"entity_type": "post", "entity_id": "1", "v": 2})], key)
            .await
            .unwrap();

        let rows = remote.rows("t");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["v"], 2);
    }

    #[tokio::test]
    async fn test_select_orders_and_limits() {
        let remote = MemoryRemote::new();
        remote.seed("t", [json!({"n": 3}), json!({"n": 1}), json!({"n": 2})]);

        let rows = remote
            .select("t", &Filter::all().gt("n", json!(1)), Some(&Order::asc("n")), Some(1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["n"], 2);
    }

    #[tokio::test]
    async fn test_select_breaks_ties_with_second_column() {
        let remote = MemoryRemote::new();
        remote.seed("t", [json!({"n": 1, "id": "b"}), json!({"n": 1, "id": "a"}), json!({"n": 0, "id": "c"})]);

        let rows = remote
            .select("t", &Filter::all(), Some(&Order::asc("n").then("id")), None)
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().filter_map(|r| r["id"].as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_server_stamp_set_once_and_increasing() {
        let remote = MemoryRemote::new();
        let key = "entity_type,entity_id";
        remote.seed("t", [json!({"entity_type": "post", "entity_id": "1"})]);
        remote.seed("t", [json!({"entity_type": "post", "entity_id": "2"})]);

        let rows = remote.rows("t");
        let first = rows[0][SERVER_STAMP_COLUMN].as_str().unwrap().to_string();
        let second = rows[1][SERVER_STAMP_COLUMN].as_str().unwrap().to_string();
        assert!(first < second);

        remote
            .upsert("t", &[json!({"entity_type": "post", "entity_id": "1", "v": 2})], key)
            .await
            .unwrap();
        let rows = remote.rows("t");
        assert_eq!(rows[0]["v"], 2);
        assert_eq!(rows[0][SERVER_STAMP_COLUMN], first.as_str());

        remote.seed("t", [json!({"entity_type": "post", "entity_id": "3", "received_at": "2020-01-01T00:00:00.000Z"})]);
        assert_eq!(remote.rows("t")[2][SERVER_STAMP_COLUMN], "2020-01-01T00:00:00.000Z");
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let remote = MemoryRemote::new();
        remote.fail_next(RemoteOp::Insert, ClientError::timeout());

        assert_eq!(remote.insert("t", &[json!({})]).await, Err(ClientError::timeout()));
        assert!(remote.insert("t", &[json!({})]).await.is_ok());
        assert_eq!(remote.calls(RemoteOp::Insert), 2);
        assert_eq!(remote.rows("t").len(), 1);
    }

    #[tokio::test]
    async fn test_offline_fails_everything() {
        let remote = MemoryRemote::new();
        remote.set_offline(true);
        assert_eq!(remote.select("t", &Filter::all(), None, None).await, Err(ClientError::offline()));
        remote.set_offline(false);
        assert!(remote.select("t", &Filter::all(), None, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_emit_reaches_matching_subscribers_until_closed() {
        let remote = MemoryRemote::new();
        let mut sub = remote
            .subscribe("messages", &Filter::all().eq("conversation_id", json!("c1")))
            .await
            .unwrap();

        let event = |conv: &str| ChangeEvent {
            kind: ChangeKind::Insert,
            table: "messages".into(),
            record: json!({"conversation_id": conv}),
            old_record: None,
            commit_timestamp: Utc::now(),
        };

        assert_eq!(remote.emit(event("c1")).await, 1);
        assert_eq!(remote.emit(event("c2")).await, 0);
        assert_eq!(sub.events.recv().await.unwrap().record["conversation_id"], "c1");

        sub.handle.close().await;
        sub.handle.close().await;
        assert_eq!(remote.closed_channels(), 1);
        assert_eq!(remote.open_channels(), 0);
        assert_eq!(remote.emit(event("c1")).await, 0);
    }
}
