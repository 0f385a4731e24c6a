// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Offline Sync
//!
//! A local-first consistency engine for mobile clients: keeps a device cache
//! consistent with a remote relational backend under unreliable connectivity.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ConsistencyEngine                       │
//! │  • start()/shutdown(), tickers, realtime reconciliation     │
//! └─────────────────────────────────────────────────────────────┘
//!        │                │                 │               │
//!        ▼                ▼                 ▼               ▼
//! ┌─────────────┐ ┌───────────────┐ ┌──────────────┐ ┌─────────────┐
//! │ Tombstone   │ │ Channel       │ │ Optimistic   │ │ Batch       │
//! │ Synchronizer│ │ Lifecycle Mgr │ │ Coordinator  │ │ Runner      │
//! │ push / pull │ │ dedup, sweep  │ │ apply, roll  │ │ chunks,     │
//! │ conflicts   │ │               │ │ back, retry  │ │ window      │
//! └─────────────┘ └───────────────┘ └──────────────┘ └─────────────┘
//!        │                │                 │               │
//!        └────────────────┴───── RetryExecutor ─────────────┘
//!                                    │
//!               RemoteClient · LocalStore · TombstoneStore
//! ```
//!
//! Every network call goes through a [`RetryExecutor`]: bounded exponential
//! backoff with jitter, retrying only what the error classification says is
//! transient.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_sync::{ConsistencyEngine, EngineConfig, EntityRef, Filter};
//! use offline_sync::remote::MemoryRemote;
//! use offline_sync::storage::MemoryLocalStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = ConsistencyEngine::connect(
//!         EngineConfig::default(),
//!         Arc::new(MemoryRemote::new()),
//!         Arc::new(MemoryLocalStore::new()),
//!     )
//!     .await
//!     .expect("Failed to build engine");
//!     engine.start().expect("Failed to start");
//!
//!     // Server-side changes flow into the local store
//!     engine.watch("posts", &Filter::all()).await.expect("Failed to watch");
//!
//!     // Deleting offline is fine; the tombstone is pushed on the next sync
//!     let post: EntityRef = "post/42".parse().unwrap();
//!     engine.delete(&post, Some("user-1".into())).await.expect("Failed to delete");
//!     let report = engine.sync().await.expect("Sync failed");
//!     println!("pushed {} deletions", report.pushed);
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: The [`ConsistencyEngine`] facade
//! - [`tombstone`]: Soft deletion, push/pull, conflict resolution
//! - [`realtime`]: Channel deduplication and recycling
//! - [`optimistic`]: Optimistic updates with confirm/rollback
//! - [`batching`]: Chunked bulk operations
//! - [`resilience`]: Retry with backoff
//! - [`remote`]: Remote client seam and an in-memory implementation
//! - [`storage`]: Local cache and tombstone stores (memory, SQLite)

pub mod batching;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod optimistic;
pub mod realtime;
pub mod remote;
pub mod resilience;
pub mod schedule;
pub mod storage;
pub mod tombstone;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use batching::{BatchError, BatchOperationRunner, BatchProgress, BatchResult};
pub use config::EngineConfig;
pub use engine::{ConsistencyEngine, EngineState, EngineStatus};
pub use entity::{CachedEntity, EntityId, EntityKind, EntityRef};
pub use error::{Classify, ErrorClass, SyncError, SyncResult};
pub use metrics::LatencyTimer;
pub use notify::{LogPushSender, Notification, PushSender};
pub use optimistic::{FailureKind, OptimisticUpdateCoordinator, PendingUpdate, UpdateEvent, UpdateOutcome};
pub use realtime::{ChannelLifecycleManager, ChannelSubscription};
pub use remote::{ChangeEvent, ChangeKind, ClientError, Filter, Order, RemoteClient};
pub use resilience::{Idempotency, RetryConfig, RetryError, RetryExecutor};
pub use schedule::Ticker;
pub use storage::{LocalStore, StoreError, TombstoneStore, WriteScope};
pub use tombstone::{
    ConflictResolution, ConflictStrategy, PullCursor, SyncConflict, SyncReport, Tombstone, TombstoneSynchronizer,
};
