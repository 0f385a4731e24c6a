// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::{Classify, ErrorClass};

/// Network-level failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Timeout,
    Dns,
    ConnectionLost,
    Offline,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Dns => write!(f, "dns"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Failures reported by a [`RemoteClient`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("transport error ({kind}): {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Backend rejected the statement. `code` is a SQLSTATE or gateway code.
    #[error("database error {code}: {message}")]
    Database { code: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("request cancelled")]
    Cancelled,
}

/// SQLSTATE: insufficient privilege (row-level security denial).
pub const PERMISSION_DENIED: &str = "42501";
/// SQLSTATE: unique constraint violation.
pub const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE: foreign key violation.
pub const FOREIGN_KEY_VIOLATION: &str = "23503";
/// Gateway code for "no rows" on a single-row request.
pub const NOT_FOUND: &str = "PGRST116";

const VALIDATION_CODES: [&str; 4] = ["22P02", "23502", "23514", "22001"];

impl ClientError {
    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn offline() -> Self {
        Self::transport(TransportKind::Offline, "no network connectivity")
    }

    #[must_use]
    pub fn timeout() -> Self {
        Self::transport(TransportKind::Timeout, "request timed out")
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            code: code.into(),
            message: message.into(),
        }
    }

    /// HTTP status if this came from an HTTP response.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Backend error code if the database rejected the request.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Database { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

impl Classify for ClientError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Transport { .. } => ErrorClass::TransientNetwork,
            Self::Http { status, .. } => match *status {
                401 | 403 | 404 => ErrorClass::PermanentRejection,
                409 => ErrorClass::Conflict,
                400 | 422 => ErrorClass::Validation,
                408 | 429 => ErrorClass::TransientNetwork,
                500..=599 => ErrorClass::TransientNetwork,
                _ => ErrorClass::Unknown,
            },
            Self::Database { code, .. } => match code.as_str() {
                PERMISSION_DENIED | UNIQUE_VIOLATION | FOREIGN_KEY_VIOLATION | NOT_FOUND => {
                    ErrorClass::PermanentRejection
                }
                c if VALIDATION_CODES.contains(&c) => ErrorClass::Validation,
                _ => ErrorClass::Unknown,
            },
            Self::InvalidRequest(_) => ErrorClass::Validation,
            Self::Decode(_) => ErrorClass::Unknown,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// Comparison used by a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gt,
    Gte,
    Lt,
    In,
}

impl FilterOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::In => "in",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

/// Conjunction of column conditions.
///
/// Displays in the `column=op.value` form realtime filters use, which is also
/// the channel dedup key:
///
/// ```
/// use offline_sync::Filter;
/// use serde_json::json;
///
/// let filter = Filter::all().eq("conversation_id", json!(5));
/// assert_eq!(filter.to_string(), "conversation_id=eq.5");
/// assert_eq!(Filter::all().to_string(), "*");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    /// Matches every row.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    fn with(mut self, column: &str, op: FilterOp, value: Value) -> Self {
        self.conditions.push(Condition {
            column: column.to_string(),
            op,
            value,
        });
        self
    }

    #[must_use]
    pub fn eq(self, column: &str, value: Value) -> Self {
        self.with(column, FilterOp::Eq, value)
    }

    #[must_use]
    pub fn gt(self, column: &str, value: Value) -> Self {
        self.with(column, FilterOp::Gt, value)
    }

    #[must_use]
    pub fn gte(self, column: &str, value: Value) -> Self {
        self.with(column, FilterOp::Gte, value)
    }

    #[must_use]
    pub fn lt(self, column: &str, value: Value) -> Self {
        self.with(column, FilterOp::Lt, value)
    }

    #[must_use]
    pub fn in_list(self, column: &str, values: Vec<Value>) -> Self {
        self.with(column, FilterOp::In, Value::Array(values))
    }

    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate against a JSON row. Missing columns never match.
    #[must_use]
    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|c| {
            let Some(actual) = row.get(&c.column) else {
                return false;
            };
            match c.op {
                FilterOp::Eq => actual == &c.value,
                FilterOp::Gt => compare_values(actual, &c.value).is_some_and(|o| o.is_gt()),
                FilterOp::Gte => compare_values(actual, &c.value).is_some_and(|o| o.is_ge()),
                FilterOp::Lt => compare_values(actual, &c.value).is_some_and(|o| o.is_lt()),
                FilterOp::In => c
                    .value
                    .as_array()
                    .is_some_and(|values| values.iter().any(|v| v == actual)),
            }
        })
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.conditions.is_empty() {
            return f.write_str("*");
        }
        for (i, c) in self.conditions.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            let value = match &c.value {
                Value::String(s) => s.clone(),
                Value::Array(items) => format!(
                    "({})",
                    items
                        .iter()
                        .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
                        .collect::<Vec<_>>()
                        .join(",")
                ),
                other => other.to_string(),
            };
            write!(f, "{}={}.{}", c.column, c.op.as_str(), value)?;
        }
        Ok(())
    }
}

/// Column the backend stamps with its own clock when a row is first written
/// (`received_at timestamptz default now()`). Rewrites keep the first stamp.
pub const SERVER_STAMP_COLUMN: &str = "received_at";

/// Order numbers numerically and strings lexically; anything else is unordered.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
    /// Breaks ties on `column`, in the same direction.
    pub then_by: Option<String>,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
            then_by: None,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: false,
            then_by: None,
        }
    }

    #[must_use]
    pub fn then(mut self, column: impl Into<String>) -> Self {
        self.then_by = Some(column.into());
        self
    }
}

/// Realtime change kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// One server-origin change delivered over a realtime channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    /// New row for inserts/updates; for deletes, whatever the server sends
    /// (usually the primary key).
    pub record: Value,
    pub old_record: Option<Value>,
    pub commit_timestamp: DateTime<Utc>,
}

/// A live push channel on the backend.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Release the server-side subscription slot. Idempotent.
    async fn close(&self);
}

/// Result of [`RemoteClient::subscribe`].
pub struct Subscription {
    pub handle: Arc<dyn ChannelHandle>,
    pub events: mpsc::Receiver<ChangeEvent>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.handle.id())
            .finish_non_exhaustive()
    }
}

/// Typed access to the remote relational backend.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn insert(&self, table: &str, rows: &[Value]) -> Result<(), ClientError>;

    /// Insert or replace rows matching on `conflict_key` (comma-separated columns).
    async fn upsert(&self, table: &str, rows: &[Value], conflict_key: &str) -> Result<(), ClientError>;

    /// Delete matching rows; returns the number removed.
    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, ClientError>;

    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: Option<&Order>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, ClientError>;

    async fn subscribe(&self, table: &str, filter: &Filter) -> Result<Subscription, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_transport_and_server_errors() {
        assert_eq!(ClientError::offline().class(), ErrorClass::TransientNetwork);
        assert_eq!(ClientError::timeout().class(), ErrorClass::TransientNetwork);
        assert_eq!(ClientError::transport(TransportKind::Dns, "nxdomain").class(), ErrorClass::TransientNetwork);
        assert_eq!(ClientError::http(503, "unavailable").class(), ErrorClass::TransientNetwork);
        assert_eq!(ClientError::http(429, "slow down").class(), ErrorClass::TransientNetwork);
    }

    #[test]
    fn test_classify_permanent_rejections() {
        assert_eq!(ClientError::database(PERMISSION_DENIED, "rls").class(), ErrorClass::PermanentRejection);
        assert_eq!(ClientError::database(UNIQUE_VIOLATION, "dup").class(), ErrorClass::PermanentRejection);
        assert_eq!(ClientError::database(FOREIGN_KEY_VIOLATION, "fk").class(), ErrorClass::PermanentRejection);
        assert_eq!(ClientError::database(NOT_FOUND, "none").class(), ErrorClass::PermanentRejection);
        assert_eq!(ClientError::http(403, "forbidden").class(), ErrorClass::PermanentRejection);
    }

    #[test]
    fn test_classify_other() {
        assert_eq!(ClientError::http(409, "conflict").class(), ErrorClass::Conflict);
        assert_eq!(ClientError::http(422, "bad").class(), ErrorClass::Validation);
        assert_eq!(ClientError::database("23502", "null").class(), ErrorClass::Validation);
        assert_eq!(ClientError::database("XX000", "internal").class(), ErrorClass::Unknown);
        assert_eq!(ClientError::Decode("eof".into()).class(), ErrorClass::Unknown);
        assert_eq!(ClientError::Cancelled.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn test_filter_matching() {
        let row = json!({"entity_type": "post", "deleted_at": "2025-01-02T00:00:00.000Z", "n": 5});

        assert!(Filter::all().matches(&row));
        assert!(Filter::all().eq("entity_type", json!("post")).matches(&row));
        assert!(!Filter::all().eq("entity_type", json!("comment")).matches(&row));
        assert!(Filter::all().gte("deleted_at", json!("2025-01-02T00:00:00.000Z")).matches(&row));
        assert!(!Filter::all().gt("deleted_at", json!("2025-01-02T00:00:00.000Z")).matches(&row));
        assert!(Filter::all().lt("n", json!(6)).matches(&row));
        assert!(Filter::all().in_list("n", vec![json!(1), json!(5)]).matches(&row));
        assert!(!Filter::all().eq("missing", json!(1)).matches(&row));
    }

    #[test]
    fn test_filter_display_is_stable_key() {
        let a = Filter::all().eq("conversation_id", json!("abc")).gt("n", json!(3));
        assert_eq!(a.to_string(), "conversation_id=eq.abc&n=gt.3");
        let b = Filter::all().in_list("id", vec![json!(1), json!(2)]);
        assert_eq!(b.to_string(), "id=in.(1,2)");
    }
}
