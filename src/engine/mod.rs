// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consistency engine facade.
//!
//! The [`ConsistencyEngine`] wires the components together around one remote
//! client and one local store:
//! - tombstone synchronizer for deletions and conflicts
//! - channel lifecycle manager for realtime subscriptions
//! - optimistic update coordinators, one per value type
//! - batch runner for bulk writes
//!
//! # Lifecycle
//!
//! ```text
//! Created ──start()──> Running ──shutdown()──> ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_sync::{ConsistencyEngine, EngineConfig, EngineState, EntityRef};
//! use offline_sync::remote::MemoryRemote;
//! use offline_sync::storage::MemoryLocalStore;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let engine = ConsistencyEngine::connect(
//!     EngineConfig::default(),
//!     Arc::new(MemoryRemote::new()),
//!     Arc::new(MemoryLocalStore::new()),
//! )
//! .await
//! .expect("engine");
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().expect("start");
//! let post: EntityRef = "post/42".parse().unwrap();
//! engine.delete(&post, None).await.expect("delete");
//! let report = engine.sync().await.expect("sync");
//! println!("pushed {} tombstones", report.pushed);
//! engine.shutdown().await;
//! # }
//! ```

mod lifecycle;
mod reconcile;
mod types;

pub use types::{EngineState, EngineStatus};

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batching::{BatchOperationRunner, BatchProgress, BatchResult};
use crate::config::EngineConfig;
use crate::entity::EntityRef;
use crate::error::SyncResult;
use crate::notify::{self, LogPushSender, Notification, PushSender};
use crate::optimistic::OptimisticUpdateCoordinator;
use crate::realtime::{ChannelLifecycleManager, ChannelSubscription};
use crate::remote::{Filter, RemoteClient};
use crate::resilience::RetryExecutor;
use crate::storage::{LocalStore, MemoryTombstoneStore, SqliteTombstoneStore, TombstoneStore};
use crate::tombstone::{ConflictResolution, SyncConflict, SyncReport, Tombstone, TombstoneSynchronizer};

use reconcile::ChangeApplier;

/// `sync()` plus the conflict notification, shareable with the sync ticker.
#[derive(Clone)]
struct SyncJob {
    tombstones: Arc<TombstoneSynchronizer>,
    push: Arc<dyn PushSender>,
    recipients: Arc<[String]>,
}

impl SyncJob {
    async fn run(&self) -> SyncResult<SyncReport> {
        let report = self.tombstones.sync().await?;
        if report.conflicts_deferred > 0 && !self.recipients.is_empty() {
            let body = format!(
                "{} deleted item(s) were edited on this device and need review",
                report.conflicts_deferred
            );
            let note = Notification::new(self.recipients.to_vec(), "Sync conflicts", body).with_metadata(json!({
                "conflicts": report.conflicts_deferred,
                "strategy": self.tombstones.strategy().as_str(),
            }));
            notify::dispatch(Arc::clone(&self.push), note);
        }
        Ok(report)
    }
}

/// Local-first consistency engine.
///
/// Shared collaborators are injected as `Arc<dyn …>`; the engine owns no
/// process-wide state, so several engines (e.g. one per signed-in account) can
/// coexist.
pub struct ConsistencyEngine {
    pub(super) config: EngineConfig,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    pub(super) remote: Arc<dyn RemoteClient>,
    pub(super) local: Arc<dyn LocalStore>,

    pub(super) tombstones: Arc<TombstoneSynchronizer>,
    pub(super) channels: ChannelLifecycleManager,
    pub(super) batch: BatchOperationRunner,
    pub(super) push: Arc<dyn PushSender>,

    /// Policy for user-facing calls
    pub(super) interactive: RetryExecutor,

    /// Cancelled on shutdown; every ticker, watcher and executor hangs off it
    pub(super) shutdown: CancellationToken,

    /// Background tasks joined on shutdown
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsistencyEngine {
    /// Create an engine over explicit stores. Must be called inside a tokio
    /// runtime (the channel manager is an actor task).
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start) to
    /// launch the background tickers.
    pub fn new(
        config: EngineConfig,
        remote: Arc<dyn RemoteClient>,
        local: Arc<dyn LocalStore>,
        tombstone_store: Arc<dyn TombstoneStore>,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Created);
        let shutdown = CancellationToken::new();

        let interactive = RetryExecutor::with_cancellation(config.interactive_retry(), shutdown.child_token());
        let background = RetryExecutor::with_cancellation(config.background_retry(), shutdown.child_token());

        let tombstones = Arc::new(TombstoneSynchronizer::new(
            Arc::clone(&remote),
            Arc::clone(&local),
            tombstone_store,
            background.child(),
            config.tombstone_config(),
        ));
        let channels = ChannelLifecycleManager::new(interactive.child(), config.channel_event_capacity);
        let batch = BatchOperationRunner::new(background).with_chunk_size(config.batch_chunk_size);

        Self {
            config,
            state,
            remote,
            local,
            tombstones,
            channels,
            batch,
            push: Arc::new(LogPushSender),
            interactive,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Create an engine whose tombstone store is chosen by the config:
    /// SQLite at `sqlite_path` if set, otherwise in memory.
    pub async fn connect(
        config: EngineConfig,
        remote: Arc<dyn RemoteClient>,
        local: Arc<dyn LocalStore>,
    ) -> SyncResult<Self> {
        let store: Arc<dyn TombstoneStore> = match &config.sqlite_path {
            Some(path) => {
                info!(path = %path, "Opening SQLite tombstone store");
                Arc::new(SqliteTombstoneStore::open_path(path).await?)
            }
            None => {
                debug!("Using in-memory tombstone store");
                Arc::new(MemoryTombstoneStore::new())
            }
        };
        Ok(Self::new(config, remote, local, store))
    }

    /// Replace the default [`LogPushSender`].
    #[must_use]
    pub fn with_push_sender(mut self, push: Arc<dyn PushSender>) -> Self {
        self.push = push;
        self
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn remote(&self) -> &Arc<dyn RemoteClient> {
        &self.remote
    }

    #[must_use]
    pub fn local_store(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    #[must_use]
    pub fn tombstones(&self) -> &Arc<TombstoneSynchronizer> {
        &self.tombstones
    }

    #[must_use]
    pub fn channels(&self) -> &ChannelLifecycleManager {
        &self.channels
    }

    #[must_use]
    pub fn batch_runner(&self) -> &BatchOperationRunner {
        &self.batch
    }

    fn sync_job(&self) -> SyncJob {
        SyncJob {
            tombstones: Arc::clone(&self.tombstones),
            push: Arc::clone(&self.push),
            recipients: self.config.conflict_notify_recipients.clone().into(),
        }
    }

    // --- Deletions and sync ---

    /// Soft-delete an entity locally; pushed on the next sync.
    pub async fn delete(&self, entity: &EntityRef, deleted_by: Option<String>) -> SyncResult<Tombstone> {
        self.tombstones.record_deletion(entity, deleted_by).await
    }

    /// Push and pull tombstones. Conflicts left for manual resolution trigger
    /// a push notification when `conflict_notify_recipients` is set.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        let _timer = crate::time_operation!("engine", "sync");
        self.sync_job().run().await
    }

    pub async fn conflicts(&self) -> SyncResult<Vec<SyncConflict>> {
        self.tombstones.conflicts().await
    }

    pub async fn resolve_conflict(
        &self,
        entity: &EntityRef,
        resolution: ConflictResolution,
    ) -> SyncResult<SyncConflict> {
        self.tombstones.resolve_conflict(entity, resolution).await
    }

    // --- Realtime ---

    /// Subscribe to changes on `resource` and reconcile them into the local
    /// store. Watching the same (resource, filter) twice shares one channel
    /// and one reconciliation task.
    #[tracing::instrument(skip(self, filter), fields(filter = %filter))]
    pub async fn watch(&self, resource: &str, filter: &Filter) -> SyncResult<ChannelSubscription> {
        let subscription = self.channels.subscribe(self.remote.as_ref(), resource, filter).await?;
        if !subscription.reused {
            let applier = ChangeApplier {
                local: Arc::clone(&self.local),
                tombstones: Arc::clone(&self.tombstones),
            };
            let task = tokio::spawn(applier.run(
                subscription.key.clone(),
                subscription.events.resubscribe(),
                self.shutdown.child_token(),
            ));
            let mut tasks = self.tasks.lock();
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
            info!(channel = %subscription.key, "Watching for realtime changes");
        }
        Ok(subscription)
    }

    /// Stop watching (resource, filter). Returns false if it wasn't watched.
    pub async fn unwatch(&self, resource: &str, filter: &Filter) -> SyncResult<bool> {
        self.channels.unsubscribe(resource, filter).await
    }

    // --- Optimistic updates and batches ---

    /// A coordinator for values of type `V` using the engine's interactive
    /// retry policy. Confirmed values keyed by an entity reference
    /// (`"post/42"`) are written to the local store. Stops on shutdown.
    #[must_use]
    pub fn optimistic<V>(&self) -> OptimisticUpdateCoordinator<V>
    where
        V: Clone + Send + Sync + Serialize + 'static,
    {
        OptimisticUpdateCoordinator::with_store(
            self.interactive.config().clone(),
            Arc::clone(&self.local),
            self.shutdown.child_token(),
        )
    }

    /// Upsert `rows` into `table` with up to `batch_max_in_flight` chunks
    /// running at once. Failed chunks are reported in the result, not retried
    /// beyond the background policy.
    #[tracing::instrument(skip(self, rows, progress), fields(rows = rows.len()))]
    pub async fn bulk_upsert(
        &self,
        table: &str,
        rows: Vec<Value>,
        conflict_key: &str,
        progress: Option<mpsc::Sender<BatchProgress>>,
    ) -> BatchResult {
        let remote = self.remote.as_ref();
        self.batch
            .parallel_batch_process(
                "bulk_upsert",
                rows,
                self.config.batch_max_in_flight,
                |chunk| async move { remote.upsert(table, &chunk, conflict_key).await },
                progress,
            )
            .await
    }

    /// Snapshot for diagnostics.
    pub async fn status(&self) -> SyncResult<EngineStatus> {
        Ok(EngineStatus {
            state: self.state(),
            active_channels: self.channels.active_count().await?,
            pending_tombstones: self.tombstones.pending_push_count().await?,
            unresolved_conflicts: self.tombstones.conflicts().await?.len(),
            last_synced_at: self.tombstones.last_synced_at(),
        })
    }
}
