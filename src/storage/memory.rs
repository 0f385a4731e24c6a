// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use super::traits::{EntityCriteria, LocalStore, StoreError, TombstoneStore, WriteScope};
use crate::entity::{CachedEntity, EntityId, EntityKind, EntityRef};
use crate::tombstone::{PullCursor, SyncConflict, Tombstone};

/// DashMap-backed entity cache.
#[derive(Default)]
pub struct MemoryLocalStore {
    data: DashMap<EntityRef, CachedEntity>,
    writes: DashMap<WriteScope, usize>,
}

impl MemoryLocalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn get(&self, entity: &EntityRef) -> Option<CachedEntity> {
        self.data.get(entity).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.data.contains_key(entity)
    }

    /// Rows written under `scope` so far.
    #[must_use]
    pub fn writes(&self, scope: WriteScope) -> usize {
        self.writes.get(&scope).map_or(0, |n| *n)
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn fetch_cached(&self, kind: EntityKind, ids: &[EntityId]) -> Result<Vec<CachedEntity>, StoreError> {
        Ok(ids
            .iter()
            .filter_map(|id| {
                let key = EntityRef { kind, id: id.clone() };
                self.data.get(&key).map(|r| r.value().clone())
            })
            .collect())
    }

    async fn save(&self, entities: &[CachedEntity], scope: WriteScope) -> Result<(), StoreError> {
        for entity in entities {
            self.data.insert(entity.entity.clone(), entity.clone());
        }
        *self.writes.entry(scope).or_insert(0) += entities.len();
        Ok(())
    }

    async fn delete(&self, criteria: &EntityCriteria) -> Result<usize, StoreError> {
        let mut removed = 0;
        self.data.retain(|key, _| {
            let hit = criteria.matches(key);
            if hit {
                removed += 1;
            }
            !hit
        });
        Ok(removed)
    }
}

/// Non-durable [`TombstoneStore`]; state is lost with the process.
#[derive(Default)]
pub struct MemoryTombstoneStore {
    tombstones: DashMap<EntityRef, Tombstone>,
    conflicts: DashMap<EntityRef, SyncConflict>,
    watermark: RwLock<Option<PullCursor>>,
}

impl MemoryTombstoneStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tombstones.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty()
    }
}

#[async_trait]
impl TombstoneStore for MemoryTombstoneStore {
    async fn load_tombstones(&self) -> Result<Vec<Tombstone>, StoreError> {
        let mut all: Vec<Tombstone> = self.tombstones.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|t| t.deleted_at);
        Ok(all)
    }

    async fn get_tombstone(&self, entity: &EntityRef) -> Result<Option<Tombstone>, StoreError> {
        Ok(self.tombstones.get(entity).map(|r| r.value().clone()))
    }

    async fn insert_if_absent(&self, tombstone: &Tombstone) -> Result<Option<Tombstone>, StoreError> {
        match self.tombstones.entry(tombstone.entity.clone()) {
            Entry::Occupied(existing) => Ok(Some(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(tombstone.clone());
                Ok(None)
            }
        }
    }

    async fn pending_push(&self) -> Result<Vec<Tombstone>, StoreError> {
        let mut pending: Vec<Tombstone> = self
            .tombstones
            .iter()
            .filter(|r| r.value().is_pending_push())
            .map(|r| r.value().clone())
            .collect();
        pending.sort_by_key(|t| t.deleted_at);
        Ok(pending)
    }

    async fn mark_synced(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<usize, StoreError> {
        let ids: HashSet<&Uuid> = ids.iter().collect();
        let mut changed = 0;
        for mut entry in self.tombstones.iter_mut() {
            let tombstone = entry.value_mut();
            if tombstone.synced_at.is_none() && ids.contains(&tombstone.id) {
                tombstone.synced_at = Some(at);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn remove_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut removed = 0;
        self.tombstones.retain(|_, t| {
            let expired = t.deleted_at < cutoff && !t.is_pending_push();
            if expired {
                removed += 1;
            }
            !expired
        });
        Ok(removed)
    }

    async fn watermark(&self) -> Result<Option<PullCursor>, StoreError> {
        Ok(self.watermark.read().clone())
    }

    async fn set_watermark(&self, cursor: &PullCursor) -> Result<(), StoreError> {
        *self.watermark.write() = Some(cursor.clone());
        Ok(())
    }

    async fn save_conflict(&self, conflict: &SyncConflict) -> Result<(), StoreError> {
        self.conflicts.insert(conflict.entity.clone(), conflict.clone());
        Ok(())
    }

    async fn get_conflict(&self, entity: &EntityRef) -> Result<Option<SyncConflict>, StoreError> {
        Ok(self.conflicts.get(entity).map(|r| r.value().clone()))
    }

    async fn remove_conflict(&self, entity: &EntityRef) -> Result<Option<SyncConflict>, StoreError> {
        Ok(self.conflicts.remove(entity).map(|(_, c)| c))
    }

    async fn conflicts(&self) -> Result<Vec<SyncConflict>, StoreError> {
        let mut all: Vec<SyncConflict> = self.conflicts.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|c| c.detected_at);
        Ok(all)
    }
}
