// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tombstones, conflicts and the resolution policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::entity::{format_timestamp, parse_timestamp, EntityRef};
use crate::error::{SyncError, SyncResult};
use crate::remote::SERVER_STAMP_COLUMN;

/// Columns the remote tombstone table is upserted on.
pub const TOMBSTONE_CONFLICT_KEY: &str = "entity_type,entity_id";

/// Position in the remote tombstone table after the last row a pull consumed.
///
/// Rows are walked in (`received_at`, `id`) order. `received_at` is stamped by
/// the server when the row first arrives, so a deletion made offline days ago
/// still sorts after everything already pulled. Both values are kept exactly as
/// the server sent them and only ever compared by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullCursor {
    pub received_at: String,
    pub id: String,
}

impl PullCursor {
    /// The cursor just past `row`, if it carries both ordering columns.
    #[must_use]
    pub fn at_row(row: &Value) -> Option<Self> {
        let received_at = row.get(SERVER_STAMP_COLUMN)?.as_str()?;
        let id = row.get("id")?.as_str()?;
        Some(Self {
            received_at: received_at.to_string(),
            id: id.to_string(),
        })
    }
}

/// A record that an entity was deleted.
///
/// At most one live tombstone exists per entity. `synced_at` is set exactly
/// once: on the first acknowledged push for local deletions, or on ingestion
/// for tombstones pulled from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: Uuid,
    pub entity: EntityRef,
    pub deleted_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
    pub is_local_origin: bool,
}

impl Tombstone {
    /// A deletion made on this device, not yet pushed.
    pub fn local(entity: EntityRef, deleted_by: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity,
            deleted_at: Utc::now(),
            synced_at: None,
            deleted_by,
            is_local_origin: true,
        }
    }

    /// A deletion learned from the server.
    pub fn remote(entity: EntityRef, deleted_at: DateTime<Utc>, deleted_by: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity,
            deleted_at,
            synced_at: Some(now),
            deleted_by,
            is_local_origin: false,
        }
    }

    #[must_use]
    pub fn with_deleted_at(mut self, deleted_at: DateTime<Utc>) -> Self {
        self.deleted_at = deleted_at;
        self
    }

    #[must_use]
    pub fn is_pending_push(&self) -> bool {
        self.is_local_origin && self.synced_at.is_none()
    }

    /// Row shape of the remote tombstone table. `received_at` is left to the server.
    #[must_use]
    pub fn to_remote_row(&self) -> Value {
        json!({
            "id": self.id.to_string(),
            "entity_type": self.entity.kind.as_str(),
            "entity_id": self.entity.id.to_string(),
            "deleted_at": format_timestamp(self.deleted_at),
            "deleted_by": self.deleted_by,
        })
    }

    /// Parse a pulled row. The result is remote-origin and synced at `now`.
    pub fn from_remote_row(row: &Value, now: DateTime<Utc>) -> SyncResult<Self> {
        let field = |name: &str| {
            row.get(name)
                .and_then(Value::as_str)
                .ok_or_else(|| SyncError::validation(format!("tombstone row missing '{}'", name)))
        };

        let entity_id = match row.get("entity_id") {
            Some(Value::Number(n)) => n.to_string(),
            _ => field("entity_id")?.to_string(),
        };
        let entity = EntityRef::parse_parts(field("entity_type")?, &entity_id)?;
        let deleted_at = parse_timestamp(field("deleted_at")?)?;
        let deleted_by = row.get("deleted_by").and_then(Value::as_str).map(str::to_string);

        let mut tombstone = Self::remote(entity, deleted_at, deleted_by, now);
        if let Some(id) = row.get("id").and_then(Value::as_str).and_then(|s| Uuid::parse_str(s).ok()) {
            tombstone.id = id;
        }
        Ok(tombstone)
    }
}

/// A pulled deletion that predates a local edit of the same entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub entity: EntityRef,
    pub deleted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_by: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// How a delete-vs-update conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Delete locally, discarding the local edit.
    DeletionWins,
    /// Keep the local edit.
    UpdateWins,
    /// Later timestamp wins; ties go to the deletion.
    #[default]
    TimestampWins,
    /// Leave the conflict for [`resolve_conflict`](super::TombstoneSynchronizer::resolve_conflict).
    Manual,
}

impl ConflictStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeletionWins => "deletion_wins",
            Self::UpdateWins => "update_wins",
            Self::TimestampWins => "timestamp_wins",
            Self::Manual => "manual",
        }
    }

    /// Decide a conflict. `None` means it needs manual resolution.
    #[must_use]
    pub fn resolve(&self, conflict: &SyncConflict) -> Option<ConflictResolution> {
        match self {
            Self::DeletionWins => Some(ConflictResolution::Delete),
            Self::UpdateWins => Some(ConflictResolution::KeepLocal),
            Self::TimestampWins if conflict.deleted_at >= conflict.updated_at => Some(ConflictResolution::Delete),
            Self::TimestampWins => Some(ConflictResolution::KeepLocal),
            Self::Manual => None,
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Apply the deletion locally.
    Delete,
    /// Keep the local row and drop the tombstone's effect.
    KeepLocal,
}

/// What happened to one incoming deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Local row removed (or was already absent).
    Applied,
    /// A tombstone already existed for the entity.
    Duplicate,
    /// Conflict settled by strategy.
    Resolved(ConflictResolution),
    /// Conflict stored for manual resolution.
    Deferred,
}

/// Summary of one `sync()` run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub push_batches_failed: usize,
    pub pulled: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub conflicts_deferred: usize,
}

impl SyncReport {
    pub(crate) fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Applied => self.applied += 1,
            ReconcileOutcome::Duplicate => self.duplicates += 1,
            ReconcileOutcome::Resolved(resolution) => {
                self.conflicts_detected += 1;
                self.conflicts_resolved += 1;
                if resolution == ConflictResolution::Delete {
                    self.applied += 1;
                }
            }
            ReconcileOutcome::Deferred => {
                self.conflicts_detected += 1;
                self.conflicts_deferred += 1;
            }
        }
    }
}

/// Tombstone synchronizer settings.
#[derive(Debug, Clone)]
pub struct TombstoneConfig {
    /// Remote table holding tombstones.
    pub table: String,
    pub push_batch_size: usize,
    pub pull_page_size: usize,
    pub retention: Duration,
    pub strategy: ConflictStrategy,
}

impl Default for TombstoneConfig {
    fn default() -> Self {
        Self {
            table: "deleted_records".to_string(),
            push_batch_size: 100,
            pull_page_size: 500,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            strategy: ConflictStrategy::TimestampWins,
        }
    }
}
