// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::entity::{CachedEntity, EntityId, EntityKind, EntityRef};
use crate::error::{Classify, ErrorClass};
use crate::tombstone::{PullCursor, SyncConflict, Tombstone};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound => ErrorClass::PermanentRejection,
            Self::Backend(_) => ErrorClass::Unknown,
            Self::Serialization(_) => ErrorClass::Validation,
        }
    }
}

/// Which flow a local write belongs to.
///
/// Concurrent flows write disjoint keys; the scope is carried to the store so
/// implementations can log, meter or isolate writes per flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteScope {
    Tombstone,
    Realtime,
    Optimistic,
    Batch,
    Application,
}

impl WriteScope {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tombstone => "tombstone",
            Self::Realtime => "realtime",
            Self::Optimistic => "optimistic",
            Self::Batch => "batch",
            Self::Application => "application",
        }
    }
}

/// Which rows of one kind a delete targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdSelector {
    /// Exact ids: numeric, UUID or string, matching the kind's id shape.
    Ids(Vec<EntityId>),
    /// Numeric ids in `start..=end`.
    NumericRange { start: i64, end: i64 },
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityCriteria {
    pub kind: EntityKind,
    pub selector: IdSelector,
}

impl EntityCriteria {
    pub fn ids(kind: EntityKind, ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            kind,
            selector: IdSelector::Ids(ids.into_iter().collect()),
        }
    }

    pub fn entity(entity: &EntityRef) -> Self {
        Self::ids(entity.kind, [entity.id.clone()])
    }

    pub fn numeric_range(kind: EntityKind, start: i64, end: i64) -> Self {
        Self {
            kind,
            selector: IdSelector::NumericRange { start, end },
        }
    }

    pub fn all(kind: EntityKind) -> Self {
        Self {
            kind,
            selector: IdSelector::All,
        }
    }

    #[must_use]
    pub fn matches(&self, entity: &EntityRef) -> bool {
        if entity.kind != self.kind {
            return false;
        }
        match &self.selector {
            IdSelector::Ids(ids) => ids.contains(&entity.id),
            IdSelector::NumericRange { start, end } => entity
                .id
                .as_numeric()
                .is_some_and(|n| (*start..=*end).contains(&n)),
            IdSelector::All => true,
        }
    }
}

/// The device-side cache of entity rows.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Cached rows for `ids`; ids with no row are skipped.
    async fn fetch_cached(&self, kind: EntityKind, ids: &[EntityId]) -> Result<Vec<CachedEntity>, StoreError>;

    /// Insert or replace rows keyed by entity.
    async fn save(&self, entities: &[CachedEntity], scope: WriteScope) -> Result<(), StoreError>;

    /// Remove matching rows; returns how many were removed.
    async fn delete(&self, criteria: &EntityCriteria) -> Result<usize, StoreError>;

    async fn fetch_one(&self, entity: &EntityRef) -> Result<Option<CachedEntity>, StoreError> {
        let mut rows = self.fetch_cached(entity.kind, std::slice::from_ref(&entity.id)).await?;
        Ok(rows.pop())
    }
}

/// Durable synchronization state: tombstones, pull watermark, unresolved conflicts.
#[async_trait]
pub trait TombstoneStore: Send + Sync {
    async fn load_tombstones(&self) -> Result<Vec<Tombstone>, StoreError>;

    async fn get_tombstone(&self, entity: &EntityRef) -> Result<Option<Tombstone>, StoreError>;

    /// Store `tombstone` unless one already exists for its entity.
    /// Returns the existing tombstone when there was one.
    async fn insert_if_absent(&self, tombstone: &Tombstone) -> Result<Option<Tombstone>, StoreError>;

    /// Local-origin tombstones not yet pushed, oldest first.
    async fn pending_push(&self) -> Result<Vec<Tombstone>, StoreError>;

    /// Set `synced_at` on tombstones that don't have one yet. Returns how many changed.
    async fn mark_synced(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Remove tombstones deleted before `cutoff`, except local ones never pushed.
    async fn remove_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Where the last completed pull stopped in the remote tombstone table.
    async fn watermark(&self) -> Result<Option<PullCursor>, StoreError>;

    async fn set_watermark(&self, cursor: &PullCursor) -> Result<(), StoreError>;

    /// Insert or replace the conflict for its entity.
    async fn save_conflict(&self, conflict: &SyncConflict) -> Result<(), StoreError>;

    async fn get_conflict(&self, entity: &EntityRef) -> Result<Option<SyncConflict>, StoreError>;

    async fn remove_conflict(&self, entity: &EntityRef) -> Result<Option<SyncConflict>, StoreError>;

    async fn conflicts(&self) -> Result<Vec<SyncConflict>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_criteria_matching() {
        let post: EntityRef = "post/42".parse().unwrap();
        let other: EntityRef = "comment/42".parse().unwrap();

        assert!(EntityCriteria::entity(&post).matches(&post));
        assert!(!EntityCriteria::entity(&post).matches(&other));
        assert!(EntityCriteria::numeric_range(EntityKind::Post, 40, 42).matches(&post));
        assert!(!EntityCriteria::numeric_range(EntityKind::Post, 43, 50).matches(&post));
        assert!(EntityCriteria::all(EntityKind::Comment).matches(&other));

        let msg = EntityRef::new(EntityKind::Message, Uuid::new_v4()).unwrap();
        assert!(!EntityCriteria::numeric_range(EntityKind::Message, 0, i64::MAX).matches(&msg));
        assert!(EntityCriteria::ids(EntityKind::Message, [msg.id.clone()]).matches(&msg));
    }

    #[test]
    fn test_store_error_classes() {
        assert_eq!(StoreError::NotFound.class(), ErrorClass::PermanentRejection);
        assert_eq!(StoreError::Backend("io".into()).class(), ErrorClass::Unknown);
    }
}
