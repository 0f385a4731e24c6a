// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity identity and cached rows.
//!
//! Every record the engine touches is addressed by an [`EntityRef`]: a closed
//! [`EntityKind`] plus an [`EntityId`] whose shape is fixed per kind. The kind
//! carries its own store mapping (remote table, id column, id shape), so an id of
//! the wrong shape is rejected at construction rather than at the backend.
//!
//! # Example
//!
//! ```
//! use offline_sync::{EntityKind, EntityRef};
//!
//! let post: EntityRef = "post/42".parse().unwrap();
//! assert_eq!(post.kind, EntityKind::Post);
//! assert_eq!(post.kind.table(), "posts");
//! assert_eq!(post.to_string(), "post/42");
//!
//! // Posts use numeric ids
//! assert!("post/not-a-number".parse::<EntityRef>().is_err());
//! ```

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};

/// Shape of the primary key a kind uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Numeric,
    Uuid,
    Text,
}

/// Supported entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Post,
    Comment,
    Message,
    Conversation,
    Profile,
    Reaction,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        Self::Post,
        Self::Comment,
        Self::Message,
        Self::Conversation,
        Self::Profile,
        Self::Reaction,
    ];

    /// Wire name, as stored in the `entity_type` column of tombstone rows.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Comment => "comment",
            Self::Message => "message",
            Self::Conversation => "conversation",
            Self::Profile => "profile",
            Self::Reaction => "reaction",
        }
    }

    /// Remote table holding rows of this kind.
    #[must_use]
    pub fn table(&self) -> &'static str {
        match self {
            Self::Post => "posts",
            Self::Comment => "comments",
            Self::Message => "messages",
            Self::Conversation => "conversations",
            Self::Profile => "profiles",
            Self::Reaction => "reactions",
        }
    }

    /// Primary key column in the remote table.
    #[must_use]
    pub fn id_column(&self) -> &'static str {
        "id"
    }

    #[must_use]
    pub fn id_kind(&self) -> IdKind {
        match self {
            Self::Post | Self::Comment => IdKind::Numeric,
            Self::Message | Self::Conversation | Self::Profile => IdKind::Uuid,
            Self::Reaction => IdKind::Text,
        }
    }

    /// Resolve a kind from its remote table name.
    #[must_use]
    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.table() == table)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| SyncError::validation(format!("unknown entity type '{}'", s)))
    }
}

/// Primary key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Numeric(i64),
    Uuid(Uuid),
    Text(String),
}

impl EntityId {
    #[must_use]
    pub fn id_kind(&self) -> IdKind {
        match self {
            Self::Numeric(_) => IdKind::Numeric,
            Self::Uuid(_) => IdKind::Uuid,
            Self::Text(_) => IdKind::Text,
        }
    }

    /// Parse a textual id into the shape `kind` expects.
    pub fn parse_for(kind: EntityKind, raw: &str) -> SyncResult<Self> {
        match kind.id_kind() {
            IdKind::Numeric => raw
                .parse::<i64>()
                .map(Self::Numeric)
                .map_err(|_| SyncError::validation(format!("{} ids are numeric, got '{}'", kind, raw))),
            IdKind::Uuid => Uuid::parse_str(raw)
                .map(Self::Uuid)
                .map_err(|_| SyncError::validation(format!("{} ids are UUIDs, got '{}'", kind, raw))),
            IdKind::Text if raw.is_empty() => {
                Err(SyncError::validation(format!("{} id must not be empty", kind)))
            }
            IdKind::Text => Ok(Self::Text(raw.to_string())),
        }
    }

    /// Read an id out of a JSON row value (number or string).
    pub fn from_json(kind: EntityKind, value: &Value) -> SyncResult<Self> {
        match value {
            Value::Number(n) if kind.id_kind() == IdKind::Numeric => n
                .as_i64()
                .map(Self::Numeric)
                .ok_or_else(|| SyncError::validation(format!("{} id out of range: {}", kind, n))),
            Value::Number(n) => Self::parse_for(kind, &n.to_string()),
            Value::String(s) => Self::parse_for(kind, s),
            other => Err(SyncError::validation(format!("{} id has unexpected type: {}", kind, other))),
        }
    }

    /// JSON form used in remote filters.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Numeric(n) => Value::from(*n),
            Self::Uuid(u) => Value::String(u.to_string()),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    #[must_use]
    pub fn as_numeric(&self) -> Option<i64> {
        match self {
            Self::Numeric(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{}", n),
            Self::Uuid(u) => write!(f, "{}", u),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(n: i64) -> Self {
        Self::Numeric(n)
    }
}

impl From<Uuid> for EntityId {
    fn from(u: Uuid) -> Self {
        Self::Uuid(u)
    }
}

/// Identity of one entity: `kind/id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityRef {
    /// Build a reference, rejecting ids whose shape doesn't match the kind.
    pub fn new(kind: EntityKind, id: impl Into<EntityId>) -> SyncResult<Self> {
        let id = id.into();
        if id.id_kind() != kind.id_kind() {
            return Err(SyncError::validation(format!(
                "{} expects {:?} ids, got {:?} ({})",
                kind,
                kind.id_kind(),
                id.id_kind(),
                id
            )));
        }
        Ok(Self { kind, id })
    }

    /// Build from wire strings (`entity_type`, `entity_id` columns).
    pub fn parse_parts(kind: &str, id: &str) -> SyncResult<Self> {
        let kind: EntityKind = kind.parse()?;
        let id = EntityId::parse_for(kind, id)?;
        Ok(Self { kind, id })
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once('/')
            .ok_or_else(|| SyncError::validation(format!("expected 'kind/id', got '{}'", s)))?;
        Self::parse_parts(kind, id)
    }
}

/// A row in the local cache.
///
/// `updated_at` is the locally recorded modification time; it is what a pulled
/// tombstone's `deleted_at` is compared against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
    pub entity: EntityRef,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

impl CachedEntity {
    pub fn new(entity: EntityRef, payload: Value) -> Self {
        Self {
            entity,
            payload,
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Build from a server record (realtime payload or select result).
    ///
    /// Uses the record's `updated_at` column when present, otherwise `fallback`.
    pub fn from_record(kind: EntityKind, record: &Value, fallback: DateTime<Utc>) -> SyncResult<Self> {
        let raw_id = record
            .get(kind.id_column())
            .ok_or_else(|| SyncError::validation(format!("{} record has no '{}' column", kind, kind.id_column())))?;
        let id = EntityId::from_json(kind, raw_id)?;
        let updated_at = record
            .get("updated_at")
            .and_then(Value::as_str)
            .map(parse_timestamp)
            .transpose()?
            .unwrap_or(fallback);

        Ok(Self {
            entity: EntityRef { kind, id },
            payload: record.clone(),
            updated_at,
        })
    }
}

/// Wire format for timestamps: RFC 3339, millisecond precision, `Z` suffix.
///
/// Fixed width, so string order equals time order.
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::validation(format!("invalid timestamp '{}': {}", raw, e)))
}
