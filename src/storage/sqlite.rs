// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed [`TombstoneStore`].
//!
//! Keeps tombstones, the pull cursor and unresolved conflicts on disk so a
//! deletion made offline survives an app restart. Timestamps are stored as
//! epoch milliseconds.
//!
//! ```sql
//! CREATE TABLE tombstones (
//!   id TEXT PRIMARY KEY,
//!   entity_type TEXT NOT NULL,
//!   entity_id TEXT NOT NULL,
//!   deleted_at INTEGER NOT NULL,
//!   synced_at INTEGER,
//!   deleted_by TEXT,
//!   is_local_origin INTEGER NOT NULL,
//!   UNIQUE (entity_type, entity_id)
//! )
//! ```
//!
//! The unique constraint is what enforces one tombstone per entity across
//! concurrent writers.
//!
//! ## sqlx Any Driver
//!
//! Goes through the `Any` driver like the rest of our SQL code, so only the
//! portable types (`i64`, `String`, `Option<_>`) are bound and decoded.

use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::traits::{StoreError, TombstoneStore};
use crate::entity::EntityRef;
use crate::resilience::{RetryConfig, RetryExecutor};
use crate::tombstone::{PullCursor, SyncConflict, Tombstone};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const WATERMARK_KEY: &str = "pull_cursor";

// SQLite's default bound-parameter limit is 999.
const MAX_IDS_PER_STATEMENT: usize = 500;

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS tombstones (
        id TEXT PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        deleted_at INTEGER NOT NULL,
        synced_at INTEGER,
        deleted_by TEXT,
        is_local_origin INTEGER NOT NULL,
        UNIQUE (entity_type, entity_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tombstones_deleted_at ON tombstones (deleted_at)",
    r#"
    CREATE TABLE IF NOT EXISTS sync_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_conflicts (
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        deleted_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_by TEXT,
        detected_at INTEGER NOT NULL,
        PRIMARY KEY (entity_type, entity_id)
    )
    "#,
];

const TOMBSTONE_COLUMNS: &str = "id, entity_type, entity_id, deleted_at, synced_at, deleted_by, is_local_origin";

fn backend(context: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("{}: {}", context, err))
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| backend("timestamp out of range", ms))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

pub struct SqliteTombstoneStore {
    pool: AnyPool,
}

impl SqliteTombstoneStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        Self::open(&url).await
    }

    /// Connect with startup-mode retry (fails fast if the path is wrong).
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        install_drivers();

        let executor = RetryExecutor::new(RetryConfig::startup());
        let pool = executor
            .execute("sqlite_connect", move || async move {
                AnyPoolOptions::new()
                    .max_connections(4)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect(url)
                    .await
                    .map_err(|e| backend("connect", e))
            })
            .await
            .map_err(|e| {
                let message = e.to_string();
                e.into_last_error().unwrap_or(StoreError::Backend(message))
            })?;

        let store = Self { pool };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        info!(url, "Tombstone store opened");
        Ok(store)
    }

    /// WAL lets the sync task read while the UI path records deletions.
    async fn enable_wal_mode(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| backend("enable WAL mode", e))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| backend("set synchronous mode", e))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| backend("init schema", e))?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn tombstone_from_row(row: &AnyRow) -> Result<Tombstone, StoreError> {
        let get_str = |col: &str| row.try_get::<String, _>(col).map_err(|e| backend(col, e));

        let id = Uuid::parse_str(&get_str("id")?).map_err(|e| backend("tombstone id", e))?;
        let entity = EntityRef::parse_parts(&get_str("entity_type")?, &get_str("entity_id")?)
            .map_err(|e| backend("tombstone entity", e))?;
        let deleted_at: i64 = row.try_get("deleted_at").map_err(|e| backend("deleted_at", e))?;
        let synced_at: Option<i64> = row.try_get("synced_at").map_err(|e| backend("synced_at", e))?;
        let deleted_by: Option<String> = row.try_get("deleted_by").map_err(|e| backend("deleted_by", e))?;
        let is_local_origin: i64 = row.try_get("is_local_origin").map_err(|e| backend("is_local_origin", e))?;

        Ok(Tombstone {
            id,
            entity,
            deleted_at: from_millis(deleted_at)?,
            synced_at: synced_at.map(from_millis).transpose()?,
            deleted_by,
            is_local_origin: is_local_origin != 0,
        })
    }

    fn conflict_from_row(row: &AnyRow) -> Result<SyncConflict, StoreError> {
        let get_str = |col: &str| row.try_get::<String, _>(col).map_err(|e| backend(col, e));
        let get_ts = |col: &str| {
            row.try_get::<i64, _>(col)
                .map_err(|e| backend(col, e))
                .and_then(from_millis)
        };

        Ok(SyncConflict {
            entity: EntityRef::parse_parts(&get_str("entity_type")?, &get_str("entity_id")?)
                .map_err(|e| backend("conflict entity", e))?,
            deleted_at: get_ts("deleted_at")?,
            updated_at: get_ts("updated_at")?,
            deleted_by: row.try_get("deleted_by").map_err(|e| backend("deleted_by", e))?,
            detected_at: get_ts("detected_at")?,
        })
    }
}

#[async_trait]
impl TombstoneStore for SqliteTombstoneStore {
    async fn load_tombstones(&self) -> Result<Vec<Tombstone>, StoreError> {
        let sql = format!("SELECT {} FROM tombstones ORDER BY deleted_at", TOMBSTONE_COLUMNS);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend("load tombstones", e))?;
        rows.iter().map(Self::tombstone_from_row).collect()
    }

    async fn get_tombstone(&self, entity: &EntityRef) -> Result<Option<Tombstone>, StoreError> {
        let sql = format!(
            "SELECT {} FROM tombstones WHERE entity_type = ? AND entity_id = ?",
            TOMBSTONE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(entity.kind.as_str())
            .bind(entity.id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("get tombstone", e))?;
        row.as_ref().map(Self::tombstone_from_row).transpose()
    }

    async fn insert_if_absent(&self, tombstone: &Tombstone) -> Result<Option<Tombstone>, StoreError> {
        let sql = format!(
            "INSERT INTO tombstones ({}) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (entity_type, entity_id) DO NOTHING",
            TOMBSTONE_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(tombstone.id.to_string())
            .bind(tombstone.entity.kind.as_str())
            .bind(tombstone.entity.id.to_string())
            .bind(to_millis(tombstone.deleted_at))
            .bind(tombstone.synced_at.map(to_millis))
            .bind(tombstone.deleted_by.clone())
            .bind(i64::from(tombstone.is_local_origin))
            .execute(&self.pool)
            .await
            .map_err(|e| backend("insert tombstone", e))?;

        if result.rows_affected() > 0 {
            return Ok(None);
        }
        debug!(entity = %tombstone.entity, "Tombstone already present");
        self.get_tombstone(&tombstone.entity).await
    }

    async fn pending_push(&self) -> Result<Vec<Tombstone>, StoreError> {
        let sql = format!(
            "SELECT {} FROM tombstones WHERE is_local_origin = 1 AND synced_at IS NULL ORDER BY deleted_at",
            TOMBSTONE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend("pending push", e))?;
        rows.iter().map(Self::tombstone_from_row).collect()
    }

    async fn mark_synced(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut changed = 0;
        for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
            let sql = format!(
                "UPDATE tombstones SET synced_at = ? WHERE synced_at IS NULL AND id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql).bind(to_millis(at));
            for id in chunk {
                query = query.bind(id.to_string());
            }
            let result = query
                .execute(&self.pool)
                .await
                .map_err(|e| backend("mark synced", e))?;
            changed += result.rows_affected() as usize;
        }
        Ok(changed)
    }

    async fn remove_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "DELETE FROM tombstones WHERE deleted_at < ? AND NOT (is_local_origin = 1 AND synced_at IS NULL)",
        )
        .bind(to_millis(cutoff))
        .execute(&self.pool)
        .await
        .map_err(|e| backend("remove expired", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn watermark(&self) -> Result<Option<PullCursor>, StoreError> {
        let row = sqlx::query("SELECT value FROM sync_state WHERE key = ?")
            .bind(WATERMARK_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend("read watermark", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("value").map_err(|e| backend("watermark value", e))?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| backend("watermark value", e))
    }

    async fn set_watermark(&self, cursor: &PullCursor) -> Result<(), StoreError> {
        let value = serde_json::to_string(cursor).map_err(|e| backend("encode watermark", e))?;
        sqlx::query(
            "INSERT INTO sync_state (key, value) VALUES (?, ?) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(WATERMARK_KEY)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| backend("write watermark", e))?;
        Ok(())
    }

    async fn save_conflict(&self, conflict: &SyncConflict) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO sync_conflicts \
             (entity_type, entity_id, deleted_at, updated_at, deleted_by, detected_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(conflict.entity.kind.as_str())
        .bind(conflict.entity.id.to_string())
        .bind(to_millis(conflict.deleted_at))
        .bind(to_millis(conflict.updated_at))
        .bind(conflict.deleted_by.clone())
        .bind(to_millis(conflict.detected_at))
        .execute(&self.pool)
        .await
        .map_err(|e| backend("save conflict", e))?;
        Ok(())
    }

    async fn get_conflict(&self, entity: &EntityRef) -> Result<Option<SyncConflict>, StoreError> {
        let row = sqlx::query(
            "SELECT entity_type, entity_id, deleted_at, updated_at, deleted_by, detected_at \
             FROM sync_conflicts WHERE entity_type = ? AND entity_id = ?",
        )
        .bind(entity.kind.as_str())
        .bind(entity.id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("read conflict", e))?;
        row.as_ref().map(Self::conflict_from_row).transpose()
    }

    async fn remove_conflict(&self, entity: &EntityRef) -> Result<Option<SyncConflict>, StoreError> {
        let Some(conflict) = self.get_conflict(entity).await? else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM sync_conflicts WHERE entity_type = ? AND entity_id = ?")
            .bind(entity.kind.as_str())
            .bind(entity.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| backend("remove conflict", e))?;
        Ok(Some(conflict))
    }

    async fn conflicts(&self) -> Result<Vec<SyncConflict>, StoreError> {
        let rows = sqlx::query(
            "SELECT entity_type, entity_id, deleted_at, updated_at, deleted_by, detected_at \
             FROM sync_conflicts ORDER BY detected_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("list conflicts", e))?;
        rows.iter().map(Self::conflict_from_row).collect()
    }
}
