// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Realtime change events → local cache.
//!
//! Inserts and updates are saved under [`WriteScope::Realtime`]. Deletes, and
//! rows arriving on the tombstone table, go through the tombstone
//! synchronizer so they get the same conflict handling as pulled deletions.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::entity::{CachedEntity, EntityId, EntityKind, EntityRef};
use crate::error::SyncResult;
use crate::metrics::{self, LatencyTimer};
use crate::realtime::ChannelKey;
use crate::remote::{ChangeEvent, ChangeKind};
use crate::storage::{LocalStore, WriteScope};
use crate::tombstone::{Tombstone, TombstoneSynchronizer};

#[derive(Clone)]
pub(super) struct ChangeApplier {
    pub(super) local: Arc<dyn LocalStore>,
    pub(super) tombstones: Arc<TombstoneSynchronizer>,
}

impl ChangeApplier {
    pub(super) async fn apply(&self, event: &ChangeEvent) -> SyncResult<()> {
        let _timer = LatencyTimer::new("realtime", "apply");
        metrics::record_realtime_change(&event.table, event.kind.as_str());

        if event.table == self.tombstones.config().table {
            // Deletes on the tombstone table are retention purges.
            if event.kind == ChangeKind::Delete {
                return Ok(());
            }
            let tombstone = Tombstone::from_remote_row(&event.record, Utc::now())?;
            self.tombstones
                .apply_remote_deletion(&tombstone.entity, tombstone.deleted_at, tombstone.deleted_by)
                .await?;
            return Ok(());
        }

        let Some(kind) = EntityKind::from_table(&event.table) else {
            debug!(table = %event.table, "Change for an unmapped table, ignoring");
            return Ok(());
        };

        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let cached = CachedEntity::from_record(kind, &event.record, event.commit_timestamp)?;
                if self.tombstones.is_deleted(&cached.entity).await? {
                    debug!(entity = %cached.entity, "Change for a deleted entity, ignoring");
                    return Ok(());
                }
                self.local.save(&[cached], WriteScope::Realtime).await?;
            }
            ChangeKind::Delete => {
                let row = event.old_record.as_ref().unwrap_or(&event.record);
                let raw_id = row.get(kind.id_column()).unwrap_or(&Value::Null);
                let entity = EntityRef {
                    kind,
                    id: EntityId::from_json(kind, raw_id)?,
                };
                self.tombstones
                    .apply_remote_deletion(&entity, event.commit_timestamp, None)
                    .await?;
            }
        }
        Ok(())
    }

    /// Apply events from one channel until it closes or `cancel` fires.
    pub(super) async fn run(self, key: ChannelKey, mut events: broadcast::Receiver<ChangeEvent>, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = events.recv() => received,
            };
            match received {
                Ok(event) => {
                    if let Err(e) = self.apply(&event).await {
                        warn!(channel = %key, table = %event.table, kind = event.kind.as_str(), error = %e, "Failed to apply realtime change");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(channel = %key, skipped, "Realtime reconciliation fell behind, changes skipped until next sync");
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!(channel = %key, "Realtime reconciliation stopped");
    }
}
