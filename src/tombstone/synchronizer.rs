// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deletion propagation between device and server.
//!
//! # Sync phases
//!
//! ```text
//! push   local unsynced tombstones ──upsert(entity_type, entity_id)──> remote
//!        (per batch, retried; synced_at set only after the batch is acked)
//! pull   remote tombstones after the cursor, keyset-paged on (received_at, id)
//! apply  per entity: no local row or older edit → delete locally
//!        newer local edit → SyncConflict → strategy
//! ```
//!
//! `received_at` is stamped by the server, never by the deleting device. A
//! tombstone pushed late with an old `deleted_at` still lands after the cursor
//! of every device that pulled before it arrived. `deleted_at` is only used to
//! decide conflicts.
//!
//! The cursor only moves after a pull fully succeeds and every row in it was
//! reconciled, so a failed pull is simply repeated next time. Application is
//! keyed on the entity rather than the tombstone id, which makes re-delivered
//! tombstones harmless.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{
    ConflictResolution, ConflictStrategy, PullCursor, ReconcileOutcome, SyncConflict, SyncReport, Tombstone,
    TombstoneConfig, TOMBSTONE_CONFLICT_KEY,
};
use crate::entity::{format_timestamp, EntityRef};
use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::remote::{Filter, Order, RemoteClient, SERVER_STAMP_COLUMN};
use crate::resilience::RetryExecutor;
use crate::storage::{EntityCriteria, LocalStore, TombstoneStore};

pub struct TombstoneSynchronizer {
    remote: Arc<dyn RemoteClient>,
    local: Arc<dyn LocalStore>,
    store: Arc<dyn TombstoneStore>,
    executor: RetryExecutor,
    config: TombstoneConfig,
    /// Serializes `sync()` and `cleanup()`.
    sync_lock: Mutex<()>,
    last_synced_at: RwLock<Option<DateTime<Utc>>>,
}

impl TombstoneSynchronizer {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        local: Arc<dyn LocalStore>,
        store: Arc<dyn TombstoneStore>,
        executor: RetryExecutor,
        config: TombstoneConfig,
    ) -> Self {
        Self {
            remote,
            local,
            store,
            executor,
            config,
            sync_lock: Mutex::new(()),
            last_synced_at: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TombstoneConfig {
        &self.config
    }

    #[must_use]
    pub fn strategy(&self) -> ConflictStrategy {
        self.config.strategy
    }

    /// Soft-delete an entity on this device.
    ///
    /// The tombstone is persisted before the cached row is removed, and waits
    /// for the next [`sync`](Self::sync) to be pushed. Calling this again for an
    /// entity that already has a tombstone returns the existing one unchanged.
    #[tracing::instrument(skip(self, entity), fields(entity = %entity))]
    pub async fn record_deletion(&self, entity: &EntityRef, deleted_by: Option<String>) -> SyncResult<Tombstone> {
        let candidate = Tombstone::local(entity.clone(), deleted_by);
        let existing = self.store.insert_if_absent(&candidate).await?;
        // Also on the repeat path, in case an earlier call failed after the insert.
        let removed = self.local.delete(&EntityCriteria::entity(entity)).await?;
        if let Some(existing) = existing {
            debug!(tombstone = %existing.id, removed, "Entity already deleted");
            return Ok(existing);
        }
        info!(tombstone = %candidate.id, removed, "Recorded local deletion");
        Ok(candidate)
    }

    /// Push local deletions, pull remote ones, and reconcile.
    ///
    /// Fails only when the pull phase fails (or the tombstone store does);
    /// push batches that fail are reported and stay queued.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        let _guard = self.sync_lock.lock().await;
        let started = Instant::now();
        let mut report = SyncReport::default();

        self.push_pending(&mut report).await?;

        let start = self.store.watermark().await?;
        let (pulled, cursor) = self.pull_after(start.clone()).await?;
        report.pulled = pulled.len();
        metrics::record_tombstones_pulled(pulled.len());

        let mut seen = HashSet::new();
        for tombstone in pulled {
            if !seen.insert(tombstone.entity.clone()) {
                report.duplicates += 1;
                continue;
            }
            let outcome = self.reconcile(tombstone).await?;
            report.record(outcome);
        }

        if let Some(cursor) = cursor.filter(|c| Some(c) != start.as_ref()) {
            self.store.set_watermark(&cursor).await?;
        }
        *self.last_synced_at.write() = Some(Utc::now());

        metrics::record_deletions_applied("pull", report.applied);
        metrics::set_pending_tombstones(self.store.pending_push().await?.len());
        metrics::record_sync_duration(started.elapsed());
        info!(
            pushed = report.pushed,
            push_batches_failed = report.push_batches_failed,
            pulled = report.pulled,
            applied = report.applied,
            conflicts = report.conflicts_detected,
            deferred = report.conflicts_deferred,
            "Tombstone sync complete"
        );
        Ok(report)
    }

    async fn push_pending(&self, report: &mut SyncReport) -> SyncResult<()> {
        let pending = self.store.pending_push().await?;
        if pending.is_empty() {
            return Ok(());
        }

        let remote = &self.remote;
        let table = self.config.table.as_str();
        for (index, batch) in pending.chunks(self.config.push_batch_size.max(1)).enumerate() {
            let rows: Vec<Value> = batch.iter().map(Tombstone::to_remote_row).collect();
            let rows = rows.as_slice();

            let result = self
                .executor
                .execute("tombstone_push", move || remote.upsert(table, rows, TOMBSTONE_CONFLICT_KEY))
                .await;

            match result {
                Ok(()) => {
                    let ids: Vec<Uuid> = batch.iter().map(|t| t.id).collect();
                    let marked = self.store.mark_synced(&ids, Utc::now()).await?;
                    report.pushed += marked;
                    metrics::record_tombstones_pushed(marked);
                    debug!(batch = index, size = batch.len(), "Pushed tombstone batch");
                }
                Err(e) if e.is_cancelled() => return Err(SyncError::Cancelled),
                Err(e) => {
                    warn!(
                        batch = index,
                        size = batch.len(),
                        error = %e,
                        "Tombstone push batch failed, will retry on next sync"
                    );
                    report.push_batches_failed += 1;
                    metrics::record_tombstone_push_failure(batch.len());
                }
            }
        }
        Ok(())
    }

    /// Every remote tombstone after `cursor`, and the cursor past the last one.
    ///
    /// Each round first drains rows sharing the cursor's `received_at` (by id),
    /// then moves on to strictly newer stamps. A bulk delete that stamps
    /// thousands of rows in the same instant is paged through like any other.
    async fn pull_after(&self, mut cursor: Option<PullCursor>) -> SyncResult<(Vec<Tombstone>, Option<PullCursor>)> {
        let page_size = self.config.pull_page_size.max(1);
        let mut pulled = Vec::new();

        loop {
            if let Some(at) = &cursor {
                let same_instant = Filter::all()
                    .eq(SERVER_STAMP_COLUMN, json!(at.received_at))
                    .gt("id", json!(at.id));
                let rows = self.fetch_page(&same_instant, &Order::asc("id"), page_size).await?;
                let full = rows.len() == page_size;
                if !Self::take_page(&rows, &mut pulled, &mut cursor) {
                    break;
                }
                if full {
                    continue;
                }
            }

            let newer = match &cursor {
                Some(at) => Filter::all().gt(SERVER_STAMP_COLUMN, json!(at.received_at)),
                None => Filter::all(),
            };
            let order = Order::asc(SERVER_STAMP_COLUMN).then("id");
            let rows = self.fetch_page(&newer, &order, page_size).await?;
            let full = rows.len() == page_size;
            if !Self::take_page(&rows, &mut pulled, &mut cursor) || !full {
                break;
            }
        }
        Ok((pulled, cursor))
    }

    async fn fetch_page(&self, filter: &Filter, order: &Order, limit: usize) -> SyncResult<Vec<Value>> {
        let remote = &self.remote;
        let table = self.config.table.as_str();
        let rows = self
            .executor
            .execute("tombstone_pull", move || remote.select(table, filter, Some(order), Some(limit)))
            .await?;
        Ok(rows)
    }

    /// Parse a page into `pulled` and move `cursor` past it. Returns false when
    /// a non-empty page could not move the cursor, which would repeat forever.
    fn take_page(rows: &[Value], pulled: &mut Vec<Tombstone>, cursor: &mut Option<PullCursor>) -> bool {
        let now = Utc::now();
        let mut advanced = false;
        for row in rows {
            match Tombstone::from_remote_row(row, now) {
                Ok(tombstone) => pulled.push(tombstone),
                Err(e) => warn!(error = %e, "Skipping malformed tombstone row"),
            }
            if let Some(next) = PullCursor::at_row(row) {
                *cursor = Some(next);
                advanced = true;
            }
        }
        if !rows.is_empty() && !advanced {
            warn!(rows = rows.len(), cursor = ?cursor, "Tombstone page has no server stamps, stopping pull");
        }
        rows.is_empty() || advanced
    }

    /// Reconcile a deletion that arrived over realtime instead of a pull.
    #[tracing::instrument(skip(self, entity), fields(entity = %entity))]
    pub async fn apply_remote_deletion(
        &self,
        entity: &EntityRef,
        deleted_at: DateTime<Utc>,
        deleted_by: Option<String>,
    ) -> SyncResult<ReconcileOutcome> {
        let tombstone = Tombstone::remote(entity.clone(), deleted_at, deleted_by, Utc::now());
        let outcome = self.reconcile(tombstone).await?;
        if matches!(outcome, ReconcileOutcome::Applied | ReconcileOutcome::Resolved(ConflictResolution::Delete)) {
            metrics::record_deletions_applied("realtime", 1);
        }
        Ok(outcome)
    }

    async fn reconcile(&self, incoming: Tombstone) -> SyncResult<ReconcileOutcome> {
        if self.store.get_tombstone(&incoming.entity).await?.is_some() {
            return Ok(ReconcileOutcome::Duplicate);
        }
        if let Some(pending) = self.store.get_conflict(&incoming.entity).await? {
            if pending.deleted_at == incoming.deleted_at {
                return Ok(ReconcileOutcome::Duplicate);
            }
        }

        let local = self.local.fetch_one(&incoming.entity).await?;
        let edited_after_delete = local.as_ref().filter(|row| row.updated_at > incoming.deleted_at);
        let Some(row) = edited_after_delete else {
            self.apply(incoming).await?;
            return Ok(ReconcileOutcome::Applied);
        };

        let conflict = SyncConflict {
            entity: incoming.entity.clone(),
            deleted_at: incoming.deleted_at,
            updated_at: row.updated_at,
            deleted_by: incoming.deleted_by.clone(),
            detected_at: Utc::now(),
        };
        let strategy = self.config.strategy;

        match strategy.resolve(&conflict) {
            Some(ConflictResolution::Delete) => {
                info!(entity = %conflict.entity, %strategy, "Conflict resolved: deletion applied");
                self.apply(incoming).await?;
                metrics::record_conflict(strategy.as_str(), "deleted");
                Ok(ReconcileOutcome::Resolved(ConflictResolution::Delete))
            }
            Some(ConflictResolution::KeepLocal) => {
                info!(entity = %conflict.entity, %strategy, "Conflict resolved: local edit kept");
                metrics::record_conflict(strategy.as_str(), "kept_local");
                Ok(ReconcileOutcome::Resolved(ConflictResolution::KeepLocal))
            }
            None => {
                warn!(entity = %conflict.entity, "Conflict stored for manual resolution");
                self.store.save_conflict(&conflict).await?;
                metrics::record_conflict(strategy.as_str(), "deferred");
                Ok(ReconcileOutcome::Deferred)
            }
        }
    }

    async fn apply(&self, tombstone: Tombstone) -> SyncResult<()> {
        // Row first: a tombstone without the row removed would read as a
        // duplicate on the next pull and never be retried.
        self.local.delete(&EntityCriteria::entity(&tombstone.entity)).await?;
        self.store.insert_if_absent(&tombstone).await?;
        Ok(())
    }

    /// Unresolved conflicts, oldest first.
    pub async fn conflicts(&self) -> SyncResult<Vec<SyncConflict>> {
        Ok(self.store.conflicts().await?)
    }

    /// Settle a stored conflict by hand.
    #[tracing::instrument(skip(self, entity), fields(entity = %entity))]
    pub async fn resolve_conflict(
        &self,
        entity: &EntityRef,
        resolution: ConflictResolution,
    ) -> SyncResult<SyncConflict> {
        let conflict = self
            .store
            .get_conflict(entity)
            .await?
            .ok_or_else(|| SyncError::validation(format!("no conflict recorded for {}", entity)))?;

        if resolution == ConflictResolution::Delete {
            let tombstone = Tombstone::remote(
                entity.clone(),
                conflict.deleted_at,
                conflict.deleted_by.clone(),
                Utc::now(),
            );
            self.apply(tombstone).await?;
        }
        self.store.remove_conflict(entity).await?;
        info!(?resolution, "Conflict resolved manually");
        metrics::record_conflict(ConflictStrategy::Manual.as_str(), "resolved");
        Ok(conflict)
    }

    /// Purge tombstones deleted more than `older_than` ago.
    ///
    /// Local deletions that were never pushed are kept. Expired rows in the
    /// remote tombstone table are removed on a best-effort basis.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self, older_than: Duration) -> SyncResult<usize> {
        let _guard = self.sync_lock.lock().await;
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let removed = self.store.remove_expired(cutoff).await?;
        metrics::record_tombstones_purged(removed);

        let filter = Filter::all().lt("deleted_at", json!(format_timestamp(cutoff)));
        let filter = &filter;
        let remote = &self.remote;
        let table = self.config.table.as_str();
        match self
            .executor
            .execute("tombstone_remote_cleanup", move || remote.delete(table, filter))
            .await
        {
            Ok(remote_removed) => debug!(remote_removed, "Purged expired remote tombstones"),
            Err(e) => warn!(error = %e, "Remote tombstone cleanup failed"),
        }

        info!(removed, cutoff = %format_timestamp(cutoff), "Tombstone cleanup complete");
        Ok(removed)
    }

    /// [`cleanup`](Self::cleanup) with the configured retention window.
    pub async fn cleanup_expired(&self) -> SyncResult<usize> {
        self.cleanup(self.config.retention).await
    }

    pub async fn tombstone_for(&self, entity: &EntityRef) -> SyncResult<Option<Tombstone>> {
        Ok(self.store.get_tombstone(entity).await?)
    }

    pub async fn is_deleted(&self, entity: &EntityRef) -> SyncResult<bool> {
        Ok(self.tombstone_for(entity).await?.is_some())
    }

    pub async fn pending_push_count(&self) -> SyncResult<usize> {
        Ok(self.store.pending_push().await?.len())
    }

    /// When the last successful `sync()` finished.
    #[must_use]
    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        *self.last_synced_at.read()
    }
}
