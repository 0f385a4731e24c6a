// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration Tests for the consistency engine
//!
//! End-to-end flows through [`ConsistencyEngine`] against the in-process
//! [`MemoryRemote`]. Nothing here needs a network or a container.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # Only happy-path tests
//! cargo test --test integration happy
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation: offline deletion, realtime, optimistic, batches
//! - `failure_*` - Offline backend, conflicts needing review, restart recovery

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use offline_sync::remote::{ChangeEvent, ChangeKind, ClientError, Filter, MemoryRemote, RemoteOp};
use offline_sync::storage::{LocalStore, MemoryLocalStore, WriteScope};
use offline_sync::{
    CachedEntity, ConflictResolution, ConflictStrategy, ConsistencyEngine, EngineConfig, EngineState, EntityRef,
    PushSender, Tombstone, UpdateOutcome,
};

// =============================================================================
// Helpers
// =============================================================================

const TOMBSTONES: &str = "deleted_records";

fn entity(raw: &str) -> EntityRef {
    raw.parse().unwrap()
}

async fn engine_with(
    config: EngineConfig,
    remote: &MemoryRemote,
    local: &Arc<MemoryLocalStore>,
) -> ConsistencyEngine {
    let engine = ConsistencyEngine::connect(config, Arc::new(remote.clone()), Arc::clone(local) as Arc<dyn LocalStore>)
        .await
        .expect("Failed to build engine");
    engine.start().expect("Failed to start engine");
    engine
}

async fn cache(local: &MemoryLocalStore, raw: &str, updated_at: chrono::DateTime<Utc>) {
    local
        .save(
            &[CachedEntity::new(entity(raw), json!({"body": "cached"})).with_updated_at(updated_at)],
            WriteScope::Application,
        )
        .await
        .unwrap();
}

/// Poll until `check` holds or a second passes.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct RecordingPush {
    sent: Mutex<Vec<(Vec<String>, String, Value)>>,
}

#[async_trait]
impl PushSender for RecordingPush {
    async fn send(&self, recipients: &[String], title: &str, _body: &str, metadata: &Value) -> Result<(), ClientError> {
        self.sent.lock().push((recipients.to_vec(), title.to_string(), metadata.clone()));
        Ok(())
    }
}

// =============================================================================
// Happy Path Tests
// =============================================================================

#[tokio::test]
async fn happy_offline_deletion_pushed_on_reconnect() {
    let remote = MemoryRemote::new();
    let local = Arc::new(MemoryLocalStore::new());
    let engine = engine_with(EngineConfig::immediate(), &remote, &local).await;

    let post = entity("post/42");
    cache(&local, "post/42", Utc::now()).await;

    remote.set_offline(true);
    let tombstone = engine.delete(&post, Some("user-1".into())).await.unwrap();
    assert!(!local.contains(&post), "deletion is visible locally while offline");
    assert!(engine.sync().await.is_err(), "pull fails while offline");
    assert_eq!(engine.tombstones().pending_push_count().await.unwrap(), 1);

    remote.set_offline(false);
    let report = engine.sync().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.push_batches_failed, 0);

    let rows = remote.rows(TOMBSTONES);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["entity_type"], "post");
    assert_eq!(rows[0]["entity_id"], "42");
    assert_eq!(rows[0]["deleted_by"], "user-1");
    assert_eq!(rows[0]["id"], tombstone.id.to_string());

    let status = engine.status().await.unwrap();
    assert_eq!(status.state, EngineState::Running);
    assert_eq!(status.pending_tombstones, 0);
    assert!(status.last_synced_at.is_some());

    // A second sync neither re-pushes nor re-applies our own tombstone
    let report = engine.sync().await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.applied, 0);
    assert_eq!(remote.rows(TOMBSTONES).len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn happy_remote_deletion_applied_on_pull() {
    let remote = MemoryRemote::new();
    let local = Arc::new(MemoryLocalStore::new());
    let engine = engine_with(EngineConfig::immediate(), &remote, &local).await;

    let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
    cache(&local, "comment/7", an_hour_ago).await;
    cache(&local, "comment/8", an_hour_ago).await;

    let remote_delete = Tombstone::remote(entity("comment/7"), Utc::now(), Some("moderator".into()), Utc::now());
    remote.seed(TOMBSTONES, [remote_delete.to_remote_row()]);

    let report = engine.sync().await.unwrap();
    assert_eq!(report.pulled, 1);
    assert_eq!(report.applied, 1);
    assert!(!local.contains(&entity("comment/7")));
    assert!(local.contains(&entity("comment/8")));
    assert!(engine.tombstones().is_deleted(&entity("comment/7")).await.unwrap());

    engine.shutdown().await;
}

#[tokio::test]
async fn happy_realtime_changes_reconciled() {
    let remote = MemoryRemote::new();
    let local = Arc::new(MemoryLocalStore::new());
    let engine = engine_with(EngineConfig::immediate(), &remote, &local).await;

    let first = engine.watch("posts", &Filter::all()).await.unwrap();
    let second = engine.watch("posts", &Filter::all()).await.unwrap();
    assert!(!first.reused);
    assert!(second.reused);
    assert_eq!(first.channel_id, second.channel_id);
    assert_eq!(remote.calls(RemoteOp::Subscribe), 1);
    assert_eq!(remote.open_channels(), 1);

    let post = entity("post/5");
    let delivered = remote
        .emit(ChangeEvent {
            kind: ChangeKind::Insert,
            table: "posts".into(),
            record: json!({"id": 5, "title": "hello"}),
            old_record: None,
            commit_timestamp: Utc::now(),
        })
        .await;
    assert_eq!(delivered, 1);
    eventually("insert to reach the cache", || local.contains(&post)).await;
    assert_eq!(local.get(&post).unwrap().payload["title"], "hello");

    remote
        .emit(ChangeEvent {
            kind: ChangeKind::Delete,
            table: "posts".into(),
            record: json!({}),
            old_record: Some(json!({"id": 5})),
            commit_timestamp: Utc::now() + chrono::Duration::seconds(1),
        })
        .await;
    eventually("delete to reach the cache", || !local.contains(&post)).await;
    assert!(engine.tombstones().is_deleted(&post).await.unwrap());

    // Late updates for a deleted entity don't resurrect it
    remote
        .emit(ChangeEvent {
            kind: ChangeKind::Update,
            table: "posts".into(),
            record: json!({"id": 5, "title": "edited"}),
            old_record: None,
            commit_timestamp: Utc::now(),
        })
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!local.contains(&post));

    assert!(engine.unwatch("posts", &Filter::all()).await.unwrap());
    assert_eq!(remote.open_channels(), 0);
    engine.shutdown().await;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Post {
    id: i64,
    title: String,
}

#[tokio::test]
async fn happy_optimistic_update_confirmed_and_cached() {
    let remote = MemoryRemote::new();
    let local = Arc::new(MemoryLocalStore::new());
    let engine = engine_with(EngineConfig::immediate(), &remote, &local).await;
    let posts = engine.optimistic::<Post>();

    let original = Post { id: 3, title: "draft".into() };
    let edited = Post { id: 3, title: "final".into() };
    let confirmed = edited.clone();
    let pending = posts
        .perform_update("post/3", edited.clone(), original, move || {
            let confirmed = confirmed.clone();
            async move { Ok::<_, ClientError>(confirmed) }
        })
        .await
        .unwrap();

    assert!(pending.outcome().await.is_confirmed());
    assert_eq!(posts.current_value("post/3").await.unwrap(), Some(edited));
    eventually("confirmed value to be cached", || local.contains(&entity("post/3"))).await;
    assert_eq!(local.writes(WriteScope::Optimistic), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn happy_batch_upsert_reports_progress() {
    let remote = MemoryRemote::new();
    let local = Arc::new(MemoryLocalStore::new());
    let engine = engine_with(EngineConfig::immediate(), &remote, &local).await;

    let rows: Vec<Value> = (0..1200).map(|i| json!({"id": i, "title": format!("post {}", i)})).collect();
    let (tx, mut rx) = mpsc::channel(16);
    let result = engine
        .batch_runner()
        .upsert_all(engine.remote().as_ref(), "posts", rows, "id", Some(tx))
        .await;

    assert!(result.is_complete_success());
    assert_eq!(result.success_count, 1200);
    assert_eq!(remote.calls(RemoteOp::Upsert), 3);
    assert_eq!(remote.rows("posts").len(), 1200);

    let mut last = None;
    while let Ok(progress) = rx.try_recv() {
        last = Some(progress);
    }
    let last = last.expect("progress was reported");
    assert_eq!(last.completed_batches, 3);
    assert_eq!(last.processed_items, 1200);

    // Same rows again through the parallel path: upserts replace, never duplicate
    let rows: Vec<Value> = (0..1200).map(|i| json!({"id": i, "title": "edited"})).collect();
    let result = engine.bulk_upsert("posts", rows, "id", None).await;
    assert_eq!(result.success_count, 1200);
    assert_eq!(remote.calls(RemoteOp::Upsert), 6);
    assert_eq!(remote.rows("posts").len(), 1200);
    assert!(remote.rows("posts").iter().all(|row| row["title"] == "edited"));

    engine.shutdown().await;
}

// =============================================================================
// Failure Scenario Tests
// =============================================================================

#[tokio::test]
async fn failure_optimistic_update_rejected_rolls_back() {
    let remote = MemoryRemote::new();
    let local = Arc::new(MemoryLocalStore::new());
    let engine = engine_with(EngineConfig::immediate(), &remote, &local).await;
    let posts = engine.optimistic::<Post>();

    let original = Post { id: 4, title: "mine".into() };
    let edited = Post { id: 4, title: "not allowed".into() };
    let pending = posts
        .perform_update("post/4", edited, original.clone(), || async {
            Err::<Post, _>(ClientError::http(403, "forbidden"))
        })
        .await
        .unwrap();

    match pending.outcome().await {
        UpdateOutcome::RolledBack { restored, .. } => assert_eq!(restored, original),
        other => panic!("expected rollback, got {:?}", other),
    }
    assert_eq!(posts.current_value("post/4").await.unwrap(), Some(original));
    assert!(!local.contains(&entity("post/4")));

    engine.shutdown().await;
}

#[tokio::test]
async fn failure_manual_conflict_notifies_and_resolves() {
    let remote = MemoryRemote::new();
    let local = Arc::new(MemoryLocalStore::new());
    let push = Arc::new(RecordingPush::default());
    let config = EngineConfig {
        conflict_strategy: ConflictStrategy::Manual,
        conflict_notify_recipients: vec!["moderator-1".into()],
        ..EngineConfig::immediate()
    };
    let engine = ConsistencyEngine::connect(config, Arc::new(remote.clone()), Arc::clone(&local) as Arc<dyn LocalStore>)
        .await
        .unwrap()
        .with_push_sender(Arc::clone(&push) as Arc<dyn PushSender>);
    engine.start().unwrap();

    let post = entity("post/9");
    cache(&local, "post/9", Utc::now()).await;
    let stale_delete = Tombstone::remote(post.clone(), Utc::now() - chrono::Duration::hours(1), None, Utc::now());
    remote.seed(TOMBSTONES, [stale_delete.to_remote_row()]);

    let report = engine.sync().await.unwrap();
    assert_eq!(report.conflicts_detected, 1);
    assert_eq!(report.conflicts_deferred, 1);
    assert!(local.contains(&post), "nothing is deleted until resolved");

    eventually("conflict notification", || push.sent.lock().len() == 1).await;
    {
        let sent = push.sent.lock();
        assert_eq!(sent[0].0, vec!["moderator-1".to_string()]);
        assert_eq!(sent[0].2["conflicts"], 1);
        assert_eq!(sent[0].2["strategy"], "manual");
    }

    // Pulling the same tombstone again doesn't duplicate the conflict
    let report = engine.sync().await.unwrap();
    assert_eq!(report.conflicts_deferred, 0);
    assert_eq!(engine.conflicts().await.unwrap().len(), 1);

    let resolved = engine.resolve_conflict(&post, ConflictResolution::Delete).await.unwrap();
    assert_eq!(resolved.entity, post);
    assert!(!local.contains(&post));
    assert!(engine.conflicts().await.unwrap().is_empty());
    assert!(engine.resolve_conflict(&post, ConflictResolution::Delete).await.is_err());

    engine.shutdown().await;
}

#[tokio::test]
async fn failure_push_rejected_stays_queued() {
    let remote = MemoryRemote::new();
    let local = Arc::new(MemoryLocalStore::new());
    let engine = engine_with(EngineConfig::immediate(), &remote, &local).await;

    engine.delete(&entity("message/6b0a7e1c-7f0e-4c1e-9a55-2f0c1a3b9d10"), None).await.unwrap();
    remote.fail_times(RemoteOp::Upsert, 3, ClientError::http(500, "boom"));

    let report = engine.sync().await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.push_batches_failed, 1);
    assert_eq!(remote.calls(RemoteOp::Upsert), 3);
    assert_eq!(engine.tombstones().pending_push_count().await.unwrap(), 1);

    let report = engine.sync().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(engine.tombstones().pending_push_count().await.unwrap(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn failure_restart_keeps_sqlite_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db").to_string_lossy().into_owned();
    let remote = MemoryRemote::new();
    let local = Arc::new(MemoryLocalStore::new());
    let config = EngineConfig {
        sqlite_path: Some(path),
        ..EngineConfig::immediate()
    };

    {
        let engine = engine_with(config.clone(), &remote, &local).await;
        engine.delete(&entity("post/1"), Some("user-1".into())).await.unwrap();
        engine.delete(&entity("comment/2"), None).await.unwrap();
        engine.shutdown().await;
    }

    let engine = engine_with(config, &remote, &local).await;
    assert_eq!(engine.tombstones().pending_push_count().await.unwrap(), 2);
    let tombstone = engine.tombstones().tombstone_for(&entity("post/1")).await.unwrap().unwrap();
    assert_eq!(tombstone.deleted_by.as_deref(), Some("user-1"));
    assert!(tombstone.is_local_origin);

    let report = engine.sync().await.unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(remote.rows(TOMBSTONES).len(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn failure_operations_after_shutdown() {
    let remote = MemoryRemote::new();
    let local = Arc::new(MemoryLocalStore::new());
    let engine = engine_with(EngineConfig::immediate(), &remote, &local).await;
    engine.watch("comments", &Filter::all()).await.unwrap();

    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::ShuttingDown);
    assert!(engine.start().is_err());
    assert_eq!(remote.open_channels(), 0);

    // Local deletions are still recorded; they wait for the next session
    engine.delete(&entity("post/77"), None).await.unwrap();
    assert_eq!(engine.tombstones().pending_push_count().await.unwrap(), 1);
}
