// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: failures injected at precise call counts.
//!
//! Wrappers around the in-memory remote and local store fail chosen calls so
//! each test can hit one recovery path on purpose.
//!
//! Run with: `cargo test --test chaos`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use offline_sync::entity::{CachedEntity, EntityId, EntityKind, EntityRef};
use offline_sync::remote::{ChangeEvent, ChangeKind, ClientError, Filter, MemoryRemote, Order, RemoteClient, Subscription};
use offline_sync::storage::{EntityCriteria, LocalStore, MemoryLocalStore, MemoryTombstoneStore, StoreError, WriteScope};
use offline_sync::{ConsistencyEngine, EngineConfig, EngineState, SyncError, Tombstone};

// =============================================================================
// Failing Wrappers - Precise Error Injection
// =============================================================================

/// Counts calls and says which ones should fail (1-indexed).
struct Fault {
    call_count: AtomicU64,
    fail_on_calls: Vec<u64>,
}

impl Fault {
    fn new(fail_on_calls: Vec<u64>) -> Self {
        Self {
            call_count: AtomicU64::new(0),
            fail_on_calls,
        }
    }

    fn none() -> Self {
        Self::new(vec![])
    }

    fn should_fail(&self) -> bool {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.fail_on_calls.contains(&count)
    }
}

/// Remote whose upserts fail on chosen calls.
struct FailingRemote {
    inner: MemoryRemote,
    upserts: Fault,
}

#[async_trait]
impl RemoteClient for FailingRemote {
    async fn insert(&self, table: &str, rows: &[Value]) -> Result<(), ClientError> {
        self.inner.insert(table, rows).await
    }

    async fn upsert(&self, table: &str, rows: &[Value], conflict_key: &str) -> Result<(), ClientError> {
        if self.upserts.should_fail() {
            return Err(ClientError::http(503, "injected upsert failure"));
        }
        self.inner.upsert(table, rows, conflict_key).await
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64, ClientError> {
        self.inner.delete(table, filter).await
    }

    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: Option<&Order>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>, ClientError> {
        self.inner.select(table, filter, order, limit).await
    }

    async fn subscribe(&self, table: &str, filter: &Filter) -> Result<Subscription, ClientError> {
        self.inner.subscribe(table, filter).await
    }
}

/// Local store whose saves and deletes fail on chosen calls.
struct FailingLocalStore {
    inner: MemoryLocalStore,
    saves: Fault,
    deletes: Fault,
}

impl FailingLocalStore {
    fn new(saves: Fault, deletes: Fault) -> Self {
        Self {
            inner: MemoryLocalStore::new(),
            saves,
            deletes,
        }
    }
}

#[async_trait]
impl LocalStore for FailingLocalStore {
    async fn fetch_cached(&self, kind: EntityKind, ids: &[EntityId]) -> Result<Vec<CachedEntity>, StoreError> {
        self.inner.fetch_cached(kind, ids).await
    }

    async fn save(&self, entities: &[CachedEntity], scope: WriteScope) -> Result<(), StoreError> {
        if self.saves.should_fail() {
            return Err(StoreError::Backend("injected save failure".into()));
        }
        self.inner.save(entities, scope).await
    }

    async fn delete(&self, criteria: &EntityCriteria) -> Result<usize, StoreError> {
        if self.deletes.should_fail() {
            return Err(StoreError::Backend("injected delete failure".into()));
        }
        self.inner.delete(criteria).await
    }
}

fn entity(raw: &str) -> EntityRef {
    raw.parse().unwrap()
}

fn engine(config: EngineConfig, remote: Arc<dyn RemoteClient>, local: Arc<dyn LocalStore>) -> ConsistencyEngine {
    ConsistencyEngine::new(config, remote, local, Arc::new(MemoryTombstoneStore::new()))
}

// =============================================================================
// Chaos Tests - Sync Under Failure
// =============================================================================

#[tokio::test]
async fn chaos_push_batch_fails_mid_sync() {
    // Batch 2 of 3 fails on every attempt; batches 1 and 3 still go through
    let remote = MemoryRemote::new();
    let failing = Arc::new(FailingRemote {
        inner: remote.clone(),
        upserts: Fault::new(vec![2, 3, 4]),
    });
    let config = EngineConfig {
        tombstone_push_batch_size: 100,
        ..EngineConfig::immediate()
    };
    let engine = engine(config, failing, Arc::new(MemoryLocalStore::new()));

    for id in 1..=250 {
        engine.delete(&entity(&format!("post/{}", id)), None).await.unwrap();
    }

    let report = engine.sync().await.unwrap();
    assert_eq!(report.pushed, 150);
    assert_eq!(report.push_batches_failed, 1);
    assert_eq!(engine.tombstones().pending_push_count().await.unwrap(), 100);
    assert_eq!(remote.rows("deleted_records").len(), 150);

    let report = engine.sync().await.unwrap();
    assert_eq!(report.pushed, 100);
    assert_eq!(report.push_batches_failed, 0);
    assert_eq!(engine.tombstones().pending_push_count().await.unwrap(), 0);
    assert_eq!(remote.rows("deleted_records").len(), 250);
}

#[tokio::test]
async fn chaos_local_delete_fails_during_pull() {
    // The failed application must be retried by the next pull, not skipped
    let remote = MemoryRemote::new();
    let local = Arc::new(FailingLocalStore::new(Fault::none(), Fault::new(vec![1])));
    let engine = engine(EngineConfig::immediate(), Arc::new(remote.clone()), Arc::clone(&local) as Arc<dyn LocalStore>);

    let comment = entity("comment/7");
    local
        .inner
        .save(
            &[CachedEntity::new(comment.clone(), json!({"id": 7})).with_updated_at(Utc::now() - chrono::Duration::hours(1))],
            WriteScope::Application,
        )
        .await
        .unwrap();
    remote.seed(
        "deleted_records",
        [Tombstone::remote(comment.clone(), Utc::now(), None, Utc::now()).to_remote_row()],
    );

    assert!(engine.sync().await.is_err());
    assert!(local.inner.contains(&comment));
    assert!(!engine.tombstones().is_deleted(&comment).await.unwrap());

    let report = engine.sync().await.unwrap();
    assert_eq!(report.applied, 1);
    assert!(!local.inner.contains(&comment));
    assert!(engine.tombstones().is_deleted(&comment).await.unwrap());
}

#[tokio::test]
async fn chaos_local_delete_fails_during_local_deletion() {
    let local = Arc::new(FailingLocalStore::new(Fault::none(), Fault::new(vec![1])));
    let engine = engine(
        EngineConfig::immediate(),
        Arc::new(MemoryRemote::new()),
        Arc::clone(&local) as Arc<dyn LocalStore>,
    );

    let post = entity("post/3");
    local
        .inner
        .save(&[CachedEntity::new(post.clone(), json!({"id": 3}))], WriteScope::Application)
        .await
        .unwrap();

    assert!(engine.delete(&post, None).await.is_err());
    assert!(local.inner.contains(&post));

    // Retrying keeps the first tombstone and removes the row this time
    let first = engine.tombstones().tombstone_for(&post).await.unwrap().unwrap();
    let again = engine.delete(&post, None).await.unwrap();
    assert_eq!(again.id, first.id);
    assert!(!local.inner.contains(&post));
}

#[tokio::test]
async fn chaos_realtime_apply_failure_keeps_watcher_alive() {
    let remote = MemoryRemote::new();
    let local = Arc::new(FailingLocalStore::new(Fault::new(vec![1]), Fault::none()));
    let engine = engine(EngineConfig::immediate(), Arc::new(remote.clone()), Arc::clone(&local) as Arc<dyn LocalStore>);
    engine.start().unwrap();
    engine.watch("posts", &Filter::all()).await.unwrap();

    for id in [1, 2] {
        remote
            .emit(ChangeEvent {
                kind: ChangeKind::Insert,
                table: "posts".into(),
                record: json!({"id": id}),
                old_record: None,
                commit_timestamp: Utc::now(),
            })
            .await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !local.inner.contains(&entity("post/2")) {
        assert!(tokio::time::Instant::now() < deadline, "second change never applied");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!local.inner.contains(&entity("post/1")));

    engine.shutdown().await;
}

// =============================================================================
// Chaos Tests - Lifecycle Edge Cases
// =============================================================================

#[tokio::test]
async fn chaos_shutdown_interrupts_retry_backoff() {
    // Pull keeps failing with a 10s backoff; shutdown must not wait it out
    let remote = MemoryRemote::new();
    remote.set_offline(true);
    let config = EngineConfig {
        sync_retry_max_attempts: 5,
        sync_retry_initial_delay_ms: 10_000,
        sync_retry_max_delay_ms: 10_000,
        ..EngineConfig::immediate()
    };
    let engine = Arc::new(engine(config, Arc::new(remote), Arc::new(MemoryLocalStore::new())));
    engine.start().unwrap();

    let sync = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.sync().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.shutdown().await;
    let result = tokio::time::timeout(Duration::from_secs(1), sync)
        .await
        .expect("sync should stop promptly after shutdown")
        .unwrap();
    assert!(matches!(result, Err(SyncError::Cancelled)), "got {:?}", result);
}

#[tokio::test]
async fn chaos_double_start() {
    let engine = engine(
        EngineConfig::default(),
        Arc::new(MemoryRemote::new()),
        Arc::new(MemoryLocalStore::new()),
    );
    engine.start().expect("First start failed");
    engine.start().expect("Second start is a no-op");
    assert!(engine.is_running());
    engine.shutdown().await;
}

#[tokio::test]
async fn chaos_shutdown_without_start() {
    let engine = engine(
        EngineConfig::default(),
        Arc::new(MemoryRemote::new()),
        Arc::new(MemoryLocalStore::new()),
    );
    assert_eq!(engine.state(), EngineState::Created);

    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::ShuttingDown);
    assert!(engine.start().is_err());
}
