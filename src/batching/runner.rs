// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chunked bulk operations with partial success.
//!
//! Items are split into fixed-size chunks. Each chunk runs under the
//! [`RetryExecutor`]; a chunk that still fails is recorded in the
//! [`BatchResult`] and the remaining chunks carry on.
//!
//! # Example
//!
//! ```
//! use offline_sync::{BatchOperationRunner, RetryConfig, RetryExecutor};
//! use offline_sync::remote::ClientError;
//!
//! # tokio_test_block(async {
//! let runner = BatchOperationRunner::new(RetryExecutor::new(RetryConfig::test())).with_chunk_size(2);
//! let items: Vec<u32> = (0..5).collect();
//!
//! let result = runner
//!     .process("double", items, |chunk| async move {
//!         let _doubled: Vec<u32> = chunk.iter().map(|n| n * 2).collect();
//!         Ok::<_, ClientError>(())
//!     }, None)
//!     .await;
//!
//! assert_eq!(result.success_count, 5);
//! assert!(result.is_complete_success());
//! # });
//! # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::entity::{EntityId, EntityKind};
use crate::error::{Classify, ErrorClass};
use crate::metrics;
use crate::remote::{Filter, RemoteClient};
use crate::resilience::{Idempotency, RetryExecutor};

pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Sent after every chunk, successful or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub completed_batches: usize,
    pub total_batches: usize,
    pub processed_items: usize,
    pub total_items: usize,
}

impl BatchProgress {
    /// Completed fraction in `0.0..=1.0`.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.total_items == 0 {
            return 1.0;
        }
        self.processed_items as f64 / self.total_items as f64
    }
}

/// A chunk that failed after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchError {
    pub chunk_index: usize,
    pub item_count: usize,
    pub class: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub success_count: usize,
    pub failed_count: usize,
    /// Ordered by chunk index.
    pub errors: Vec<BatchError>,
}

impl BatchResult {
    #[must_use]
    pub fn is_complete_success(&self) -> bool {
        self.failed_count == 0
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.success_count + self.failed_count
    }
}

struct Tally {
    result: BatchResult,
    progress: BatchProgress,
}

impl Tally {
    fn new(total_items: usize, total_batches: usize) -> Self {
        Self {
            result: BatchResult::default(),
            progress: BatchProgress {
                completed_batches: 0,
                total_batches,
                processed_items: 0,
                total_items,
            },
        }
    }

    fn record(&mut self, index: usize, size: usize, failure: Option<(ErrorClass, String)>) -> BatchProgress {
        match failure {
            None => self.result.success_count += size,
            Some((class, message)) => {
                self.result.failed_count += size;
                self.result.errors.push(BatchError {
                    chunk_index: index,
                    item_count: size,
                    class,
                    message,
                });
            }
        }
        self.progress.completed_batches += 1;
        self.progress.processed_items += size;
        self.progress
    }

    fn finish(mut self) -> BatchResult {
        self.result.errors.sort_by_key(|e| e.chunk_index);
        self.result
    }
}

#[derive(Clone)]
pub struct BatchOperationRunner {
    executor: RetryExecutor,
    chunk_size: usize,
    idempotency: Idempotency,
}

impl BatchOperationRunner {
    pub fn new(executor: RetryExecutor) -> Self {
        Self {
            executor,
            chunk_size: DEFAULT_CHUNK_SIZE,
            idempotency: Idempotency::Idempotent,
        }
    }

    /// Items per chunk. Zero is treated as one.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// How unclassified chunk failures are retried by `process` and
    /// `parallel_batch_process`.
    #[must_use]
    pub fn with_idempotency(mut self, idempotency: Idempotency) -> Self {
        self.idempotency = idempotency;
        self
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn chunks<T: Clone>(&self, items: &[T]) -> Vec<Vec<T>> {
        items.chunks(self.chunk_size).map(<[T]>::to_vec).collect()
    }

    async fn run_chunk<T, R, E, F, Fut>(
        &self,
        operation: &str,
        idempotency: Idempotency,
        index: usize,
        chunk: &[T],
        op: &F,
    ) -> Option<(ErrorClass, String)>
    where
        T: Clone,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: std::error::Error + Classify + 'static,
    {
        let result = self
            .executor
            .execute_with(operation, idempotency, || op(chunk.to_vec()))
            .await;
        metrics::record_batch_chunk(operation, chunk.len(), result.is_ok());
        match result {
            Ok(_) => {
                debug!(operation, chunk = index, size = chunk.len(), "Chunk complete");
                None
            }
            Err(e) => {
                warn!(operation, chunk = index, size = chunk.len(), error = %e, "Chunk failed");
                Some((e.class(), e.to_string()))
            }
        }
    }

    /// Run `op` over `items` one chunk at a time.
    ///
    /// `op` receives an owned copy of the chunk on every attempt.
    pub async fn process<T, R, E, F, Fut>(
        &self,
        operation: &str,
        items: Vec<T>,
        op: F,
        progress: Option<mpsc::Sender<BatchProgress>>,
    ) -> BatchResult
    where
        T: Clone,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: std::error::Error + Classify + 'static,
    {
        self.process_with(operation, self.idempotency, items, op, progress).await
    }

    async fn process_with<T, R, E, F, Fut>(
        &self,
        operation: &str,
        idempotency: Idempotency,
        items: Vec<T>,
        op: F,
        progress: Option<mpsc::Sender<BatchProgress>>,
    ) -> BatchResult
    where
        T: Clone,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: std::error::Error + Classify + 'static,
    {
        let started = Instant::now();
        let chunks = self.chunks(&items);
        let mut tally = Tally::new(items.len(), chunks.len());

        for (index, chunk) in chunks.iter().enumerate() {
            let failure = self.run_chunk(operation, idempotency, index, chunk, &op).await;
            let snapshot = tally.record(index, chunk.len(), failure);
            if let Some(tx) = &progress {
                let _ = tx.send(snapshot).await;
            }
        }

        let result = tally.finish();
        metrics::record_latency("batch", operation, started.elapsed());
        info!(
            operation,
            succeeded = result.success_count,
            failed = result.failed_count,
            chunks = chunks.len(),
            "Batch complete"
        );
        result
    }

    /// Like [`process`](Self::process), with up to `max_in_flight` chunks
    /// running at once. A finished chunk is immediately replaced by the next
    /// queued one.
    pub async fn parallel_batch_process<T, R, E, F, Fut>(
        &self,
        operation: &str,
        items: Vec<T>,
        max_in_flight: usize,
        op: F,
        progress: Option<mpsc::Sender<BatchProgress>>,
    ) -> BatchResult
    where
        T: Clone,
        F: Fn(Vec<T>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: std::error::Error + Classify + 'static,
    {
        let started = Instant::now();
        let chunks = self.chunks(&items);
        let mut tally = Tally::new(items.len(), chunks.len());
        let idempotency = self.idempotency;
        let op = &op;

        let mut queued = chunks.iter().enumerate().map(|(index, chunk)| async move {
            let failure = self.run_chunk(operation, idempotency, index, chunk, op).await;
            (index, chunk.len(), failure)
        });
        let mut in_flight: FuturesUnordered<_> = queued.by_ref().take(max_in_flight.max(1)).collect();

        while let Some((index, size, failure)) = in_flight.next().await {
            let snapshot = tally.record(index, size, failure);
            if let Some(tx) = &progress {
                let _ = tx.send(snapshot).await;
            }
            if let Some(next) = queued.next() {
                in_flight.push(next);
            }
        }

        let result = tally.finish();
        metrics::record_latency("batch", operation, started.elapsed());
        info!(
            operation,
            succeeded = result.success_count,
            failed = result.failed_count,
            chunks = chunks.len(),
            max_in_flight,
            "Parallel batch complete"
        );
        result
    }

    /// Insert `rows` into `table`. Inserts are not idempotent, so only
    /// classified transient failures are retried.
    #[tracing::instrument(skip(self, client, rows, progress), fields(rows = rows.len()))]
    pub async fn insert_all(
        &self,
        client: &dyn RemoteClient,
        table: &str,
        rows: Vec<Value>,
        progress: Option<mpsc::Sender<BatchProgress>>,
    ) -> BatchResult {
        self.process_with(
            "batch_insert",
            Idempotency::NonIdempotent,
            rows,
            |chunk| async move { client.insert(table, &chunk).await },
            progress,
        )
        .await
    }

    /// Upsert `rows` into `table` keyed on `conflict_key`.
    #[tracing::instrument(skip(self, client, rows, progress), fields(rows = rows.len()))]
    pub async fn upsert_all(
        &self,
        client: &dyn RemoteClient,
        table: &str,
        rows: Vec<Value>,
        conflict_key: &str,
        progress: Option<mpsc::Sender<BatchProgress>>,
    ) -> BatchResult {
        self.process_with(
            "batch_upsert",
            Idempotency::Idempotent,
            rows,
            |chunk| async move { client.upsert(table, &chunk, conflict_key).await },
            progress,
        )
        .await
    }

    /// Delete rows of `kind` by id, one `in` filter per chunk.
    #[tracing::instrument(skip(self, client, ids, progress), fields(ids = ids.len()))]
    pub async fn delete_all(
        &self,
        client: &dyn RemoteClient,
        kind: EntityKind,
        ids: Vec<EntityId>,
        progress: Option<mpsc::Sender<BatchProgress>>,
    ) -> BatchResult {
        self.process_with(
            "batch_delete",
            Idempotency::Idempotent,
            ids,
            |chunk| async move {
                let filter = Filter::all().in_list(kind.id_column(), chunk.iter().map(EntityId::to_json).collect());
                client.delete(kind.table(), &filter).await
            },
            progress,
        )
        .await
    }
}
