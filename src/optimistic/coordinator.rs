// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Optimistic updates.
//!
//! ```text
//! perform_update ──> Applied (optimistic value visible)
//!                       │
//!                 server operation (own task)
//!        ┌──────────────┼──────────────────────┬───────────────────┐
//!        ok        network/server error    other error /        newer update,
//!        │          and retries left        retries exhausted   cancel_update
//!    Confirmed       Retrying ──sleep──┐     RolledBack          Cancelled
//!                          └───────────┘
//! ```
//!
//! The actor owns the visible values and the pending table. Worker tasks
//! report back tagged with their update id; reports from an update that is no
//! longer the pending one for its entity are dropped, so each update resolves
//! exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::types::{FailureKind, PendingInfo, PendingUpdate, UpdateEvent, UpdateOutcome};
use crate::entity::{CachedEntity, EntityRef};
use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::remote::ClientError;
use crate::resilience::RetryConfig;
use crate::storage::{LocalStore, WriteScope};

const COMMAND_BUFFER: usize = 64;
const EVENT_CAPACITY: usize = 256;
const ACTOR_NAME: &str = "optimistic coordinator";

/// One call to the server. Invoked again for each retry.
pub type ServerOperation<V> = Box<dyn FnMut() -> BoxFuture<'static, Result<V, ClientError>> + Send>;

/// Writes confirmed values into the local cache.
struct ConfirmedSink<V> {
    store: Arc<dyn LocalStore>,
    encode: fn(&V) -> serde_json::Result<Value>,
}

impl<V> Clone for ConfirmedSink<V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            encode: self.encode,
        }
    }
}

impl<V> ConfirmedSink<V> {
    async fn persist(&self, entity_id: &str, value: &V) {
        let Ok(entity) = entity_id.parse::<EntityRef>() else {
            debug!(entity_id, "Not an entity reference, confirmed value not cached");
            return;
        };
        let payload = match (self.encode)(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(entity_id, error = %e, "Failed to encode confirmed value");
                return;
            }
        };
        if let Err(e) = self
            .store
            .save(&[CachedEntity::new(entity, payload)], WriteScope::Optimistic)
            .await
        {
            warn!(entity_id, error = %e, "Failed to cache confirmed value");
        }
    }
}

enum Command<V> {
    Perform {
        entity_id: String,
        optimistic: V,
        original: V,
        operation: ServerOperation<V>,
        reply: oneshot::Sender<PendingUpdate<V>>,
    },
    Cancel {
        entity_id: String,
        reply: oneshot::Sender<bool>,
    },
    CancelAll {
        reply: oneshot::Sender<usize>,
    },
    CurrentValue {
        entity_id: String,
        reply: oneshot::Sender<Option<V>>,
    },
    Pending {
        reply: oneshot::Sender<Vec<PendingInfo>>,
    },
}

enum Report<V> {
    Retrying {
        entity_id: String,
        id: Uuid,
        retry_count: u32,
        delay: Duration,
        kind: FailureKind,
        cause: String,
    },
    Finished {
        entity_id: String,
        id: Uuid,
        result: Result<V, (FailureKind, String)>,
    },
}

struct PendingEntry<V> {
    id: Uuid,
    original: V,
    started_at: Instant,
    retry_count: u32,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    outcome: oneshot::Sender<UpdateOutcome<V>>,
}

struct CoordinatorActor<V> {
    pending: HashMap<String, PendingEntry<V>>,
    values: HashMap<String, V>,
    events: broadcast::Sender<UpdateEvent<V>>,
    reports_tx: mpsc::UnboundedSender<Report<V>>,
    retry: RetryConfig,
    cancel: CancellationToken,
    sink: Option<ConfirmedSink<V>>,
}

impl<V: Clone + Send + Sync + 'static> CoordinatorActor<V> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command<V>>, mut reports: mpsc::UnboundedReceiver<Report<V>>) {
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(report) = reports.recv() => self.on_report(report),
            }
        }
        let cancelled = self.cancel_all(false);
        if cancelled > 0 {
            info!(cancelled, "Optimistic coordinator stopped with updates in flight");
        }
    }

    fn handle(&mut self, cmd: Command<V>) {
        match cmd {
            Command::Perform {
                entity_id,
                optimistic,
                original,
                operation,
                reply,
            } => {
                let pending = self.perform(entity_id, optimistic, original, operation);
                let _ = reply.send(pending);
            }
            Command::Cancel { entity_id, reply } => {
                let _ = reply.send(self.cancel_one(&entity_id, false));
            }
            Command::CancelAll { reply } => {
                let _ = reply.send(self.cancel_all(false));
            }
            Command::CurrentValue { entity_id, reply } => {
                let _ = reply.send(self.values.get(&entity_id).cloned());
            }
            Command::Pending { reply } => {
                let now = Instant::now();
                let mut infos: Vec<PendingInfo> = self
                    .pending
                    .iter()
                    .map(|(entity_id, entry)| PendingInfo {
                        id: entry.id,
                        entity_id: entity_id.clone(),
                        retry_count: entry.retry_count,
                        age: now.saturating_duration_since(entry.started_at),
                    })
                    .collect();
                infos.sort_by(|a, b| b.age.cmp(&a.age));
                let _ = reply.send(infos);
            }
        }
    }

    fn perform(
        &mut self,
        entity_id: String,
        optimistic: V,
        original: V,
        operation: ServerOperation<V>,
    ) -> PendingUpdate<V> {
        if self.pending.contains_key(&entity_id) {
            self.cancel_one(&entity_id, true);
        }

        let id = Uuid::new_v4();
        let cancel = self.cancel.child_token();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        self.values.insert(entity_id.clone(), optimistic.clone());
        self.publish(UpdateEvent::Applied {
            id,
            entity_id: entity_id.clone(),
            value: optimistic.clone(),
        });
        metrics::record_optimistic_event("applied");

        let task = tokio::spawn(drive(
            entity_id.clone(),
            id,
            operation,
            self.retry.clone(),
            cancel.clone(),
            self.reports_tx.clone(),
            self.sink.clone(),
        ));

        self.pending.insert(
            entity_id.clone(),
            PendingEntry {
                id,
                original,
                started_at: Instant::now(),
                retry_count: 0,
                cancel,
                task,
                outcome: outcome_tx,
            },
        );
        metrics::set_pending_updates(self.pending.len());
        debug!(%id, entity_id, "Optimistic update applied");

        PendingUpdate {
            id,
            entity_id,
            value: optimistic,
            outcome: outcome_rx,
        }
    }

    fn on_report(&mut self, report: Report<V>) {
        match report {
            Report::Retrying {
                entity_id,
                id,
                retry_count,
                delay,
                kind,
                cause,
            } => {
                let Some(entry) = self.pending.get_mut(&entity_id).filter(|e| e.id == id) else {
                    return;
                };
                entry.retry_count = retry_count;
                warn!(%id, entity_id, retry_count, ?delay, %kind, error = %cause, "Server operation failed, retrying");
                self.publish(UpdateEvent::Retrying {
                    id,
                    entity_id,
                    retry_count,
                    delay,
                    kind,
                });
                metrics::record_optimistic_event("retrying");
            }
            Report::Finished { entity_id, id, result } => {
                if !self.pending.get(&entity_id).is_some_and(|e| e.id == id) {
                    debug!(%id, entity_id, "Ignoring completion of a replaced update");
                    return;
                }
                let Some(entry) = self.pending.remove(&entity_id) else {
                    return;
                };
                let outcome = match result {
                    Ok(value) => {
                        info!(%id, entity_id, "Optimistic update confirmed");
                        self.values.insert(entity_id.clone(), value.clone());
                        self.publish(UpdateEvent::Confirmed {
                            id,
                            entity_id,
                            value: value.clone(),
                        });
                        UpdateOutcome::Confirmed { value }
                    }
                    Err((kind, cause)) => {
                        warn!(%id, entity_id, %kind, error = %cause, "Optimistic update rolled back");
                        let message = kind.user_message().to_string();
                        self.values.insert(entity_id.clone(), entry.original.clone());
                        self.publish(UpdateEvent::RolledBack {
                            id,
                            entity_id,
                            restored: entry.original.clone(),
                            kind,
                            message: message.clone(),
                        });
                        UpdateOutcome::RolledBack {
                            kind,
                            message,
                            restored: entry.original,
                        }
                    }
                };
                metrics::record_optimistic_event(outcome.label());
                metrics::set_pending_updates(self.pending.len());
                let _ = entry.outcome.send(outcome);
            }
        }
    }

    /// Stop the pending update for `entity_id`. A superseded update keeps the
    /// visible value (the replacement sets it); a cancelled one restores the
    /// original.
    fn cancel_one(&mut self, entity_id: &str, superseded: bool) -> bool {
        let Some(entry) = self.pending.remove(entity_id) else {
            return false;
        };
        entry.cancel.cancel();
        entry.task.abort();

        if !superseded {
            self.values.insert(entity_id.to_string(), entry.original);
        }
        self.publish(UpdateEvent::Cancelled {
            id: entry.id,
            entity_id: entity_id.to_string(),
            superseded,
        });
        let outcome = UpdateOutcome::Cancelled { superseded };
        metrics::record_optimistic_event(outcome.label());
        metrics::set_pending_updates(self.pending.len());
        debug!(id = %entry.id, entity_id, superseded, "Optimistic update cancelled");
        let _ = entry.outcome.send(outcome);
        true
    }

    fn cancel_all(&mut self, superseded: bool) -> usize {
        let ids: Vec<String> = self.pending.keys().cloned().collect();
        ids.iter().filter(|id| self.cancel_one(id, superseded)).count()
    }

    fn publish(&self, event: UpdateEvent<V>) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn drive<V: Send + 'static>(
    entity_id: String,
    id: Uuid,
    mut operation: ServerOperation<V>,
    retry: RetryConfig,
    cancel: CancellationToken,
    reports: mpsc::UnboundedSender<Report<V>>,
    sink: Option<ConfirmedSink<V>>,
) {
    let max_retries = retry.max_attempts.saturating_sub(1);
    let mut retry_count = 0u32;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = operation() => result,
        };

        match result {
            Ok(value) => {
                if let Some(sink) = &sink {
                    sink.persist(&entity_id, &value).await;
                }
                let _ = reports.send(Report::Finished {
                    entity_id,
                    id,
                    result: Ok(value),
                });
                return;
            }
            Err(e) => {
                let kind = FailureKind::from_error(&e);
                if !kind.is_retryable() || retry_count >= max_retries {
                    let _ = reports.send(Report::Finished {
                        entity_id,
                        id,
                        result: Err((kind, e.to_string())),
                    });
                    return;
                }

                let delay = retry.delay_for_attempt(retry_count);
                retry_count += 1;
                let _ = reports.send(Report::Retrying {
                    entity_id: entity_id.clone(),
                    id,
                    retry_count,
                    delay,
                    kind,
                    cause: e.to_string(),
                });
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Handle to the optimistic update actor for values of type `V`.
///
/// Cheap to clone. When the last handle is dropped, or the token given to
/// [`with_store`](Self::with_store) is cancelled, the actor cancels everything
/// still in flight and stops.
pub struct OptimisticUpdateCoordinator<V> {
    commands: mpsc::Sender<Command<V>>,
    events: broadcast::Sender<UpdateEvent<V>>,
}

impl<V> Clone for OptimisticUpdateCoordinator<V> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            events: self.events.clone(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> OptimisticUpdateCoordinator<V> {
    /// Spawn the actor. Must be called inside a tokio runtime.
    ///
    /// `retry` supplies the backoff schedule; `max_attempts - 1` is the number
    /// of retries a network or server failure gets.
    pub fn new(retry: RetryConfig) -> Self {
        Self::spawn(retry, CancellationToken::new(), None)
    }

    /// Like [`new`](Self::new), but confirmed values whose entity id parses as
    /// an [`EntityRef`] are also saved to `store`.
    pub fn with_store(retry: RetryConfig, store: Arc<dyn LocalStore>, cancel: CancellationToken) -> Self
    where
        V: Serialize,
    {
        let sink = ConfirmedSink {
            store,
            encode: |value| serde_json::to_value(value),
        };
        Self::spawn(retry, cancel, Some(sink))
    }

    fn spawn(retry: RetryConfig, cancel: CancellationToken, sink: Option<ConfirmedSink<V>>) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let actor = CoordinatorActor {
            pending: HashMap::new(),
            values: HashMap::new(),
            events: events.clone(),
            reports_tx,
            retry,
            cancel,
            sink,
        };
        tokio::spawn(actor.run(rx, reports_rx));
        Self { commands, events }
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command<V>) -> SyncResult<R> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SyncError::ActorStopped(ACTOR_NAME))?;
        rx.await.map_err(|_| SyncError::ActorStopped(ACTOR_NAME))
    }

    /// Show `optimistic` right away and confirm it with the server.
    ///
    /// `server_operation` is called once per attempt. Any update still pending
    /// for `entity_id` is superseded first. Server failures never surface here;
    /// they resolve the returned handle as rolled back.
    pub async fn perform_update<F, Fut>(
        &self,
        entity_id: impl Into<String>,
        optimistic: V,
        original: V,
        mut server_operation: F,
    ) -> SyncResult<PendingUpdate<V>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ClientError>> + Send + 'static,
    {
        let entity_id = entity_id.into();
        let operation: ServerOperation<V> = Box::new(move || server_operation().boxed());
        self.request(|reply| Command::Perform {
            entity_id,
            optimistic,
            original,
            operation,
            reply,
        })
        .await
    }

    /// Abort the pending update for `entity_id` and restore its original
    /// value. Returns false if nothing was pending.
    pub async fn cancel_update(&self, entity_id: &str) -> SyncResult<bool> {
        let entity_id = entity_id.to_string();
        self.request(|reply| Command::Cancel { entity_id, reply }).await
    }

    /// Abort every pending update. Returns how many were cancelled.
    pub async fn cancel_all_updates(&self) -> SyncResult<usize> {
        self.request(|reply| Command::CancelAll { reply }).await
    }

    /// The value the UI should show for `entity_id`.
    pub async fn current_value(&self, entity_id: &str) -> SyncResult<Option<V>> {
        let entity_id = entity_id.to_string();
        self.request(|reply| Command::CurrentValue { entity_id, reply }).await
    }

    pub async fn pending(&self) -> SyncResult<Vec<PendingInfo>> {
        self.request(|reply| Command::Pending { reply }).await
    }

    pub async fn pending_count(&self) -> SyncResult<usize> {
        Ok(self.pending().await?.len())
    }

    pub async fn is_pending(&self, entity_id: &str) -> SyncResult<bool> {
        Ok(self.pending().await?.iter().any(|p| p.entity_id == entity_id))
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent<V>> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::TransportKind;
    use crate::storage::MemoryLocalStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn coordinator() -> OptimisticUpdateCoordinator<i64> {
        OptimisticUpdateCoordinator::new(RetryConfig::test())
    }

    fn counted<T: Clone + Send + 'static>(
        calls: &Arc<AtomicU32>,
        result: Result<T, ClientError>,
    ) -> impl FnMut() -> futures::future::Ready<Result<T, ClientError>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(result.clone())
        }
    }

    #[tokio::test]
    async fn test_confirmed_update() {
        let coordinator = coordinator();
        let mut events = coordinator.subscribe();

        let pending = coordinator
            .perform_update("post/1/likes", 11, 10, || async { Ok::<_, ClientError>(12) })
            .await
            .unwrap();
        assert_eq!(pending.value, 11);

        assert_eq!(pending.outcome().await, UpdateOutcome::Confirmed { value: 12 });
        assert_eq!(coordinator.current_value("post/1/likes").await.unwrap(), Some(12));
        assert_eq!(coordinator.pending_count().await.unwrap(), 0);

        assert!(matches!(events.recv().await.unwrap(), UpdateEvent::Applied { value: 11, .. }));
        assert!(matches!(events.recv().await.unwrap(), UpdateEvent::Confirmed { value: 12, .. }));
    }

    #[tokio::test]
    async fn test_permanent_failure_rolls_back_without_retry() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicU32::new(0));

        let pending = coordinator
            .perform_update("post/1/likes", 11, 10, counted(&calls, Err(ClientError::http(403, "rls"))))
            .await
            .unwrap();

        match pending.outcome().await {
            UpdateOutcome::RolledBack { kind, message, restored } => {
                assert_eq!(kind, FailureKind::Authorization);
                assert_eq!(restored, 10);
                assert!(!message.is_empty());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.current_value("post/1/likes").await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn test_network_failure_retries_then_rolls_back() {
        let coordinator = coordinator();
        let mut events = coordinator.subscribe();
        let calls = Arc::new(AtomicU32::new(0));

        let pending = coordinator
            .perform_update("k", 1, 0, counted(&calls, Err(ClientError::offline())))
            .await
            .unwrap();
        let outcome = pending.outcome().await;

        assert!(outcome.is_rolled_back());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let mut retries = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, UpdateEvent::Retrying { kind: FailureKind::Network, .. }) {
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);

        let pending = coordinator
            .perform_update("k", 1, 0, move || {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ClientError::transport(TransportKind::ConnectionLost, "reset"))
                    } else {
                        Ok::<_, ClientError>(5)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(pending.outcome().await, UpdateOutcome::Confirmed { value: 5 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_newer_update_supersedes() {
        let coordinator = coordinator();
        let mut events = coordinator.subscribe();

        let first = coordinator
            .perform_update("k", 1, 0, || futures::future::pending::<Result<i64, ClientError>>())
            .await
            .unwrap();
        let first_id = first.id;
        let second = coordinator
            .perform_update("k", 2, 1, || async { Ok::<_, ClientError>(2) })
            .await
            .unwrap();

        assert_eq!(first.outcome().await, UpdateOutcome::Cancelled { superseded: true });
        assert_eq!(second.outcome().await, UpdateOutcome::Confirmed { value: 2 });
        assert_eq!(coordinator.current_value("k").await.unwrap(), Some(2));

        let mut terminal_for_first = 0;
        while let Ok(event) = events.try_recv() {
            if event.id() == first_id && event.is_terminal() {
                terminal_for_first += 1;
            }
        }
        assert_eq!(terminal_for_first, 1);
    }

    #[tokio::test]
    async fn test_cancel_restores_original() {
        let coordinator = coordinator();
        let pending = coordinator
            .perform_update("k", 7, 3, || futures::future::pending::<Result<i64, ClientError>>())
            .await
            .unwrap();
        assert!(coordinator.is_pending("k").await.unwrap());

        assert!(coordinator.cancel_update("k").await.unwrap());
        assert!(!coordinator.cancel_update("k").await.unwrap());
        assert_eq!(pending.outcome().await, UpdateOutcome::Cancelled { superseded: false });
        assert_eq!(coordinator.current_value("k").await.unwrap(), Some(3));
        assert!(!coordinator.is_pending("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let coordinator = coordinator();
        let mut handles = vec![];
        for i in 0..4 {
            let pending = coordinator
                .perform_update(format!("k{}", i), i + 100, i, || {
                    futures::future::pending::<Result<i64, ClientError>>()
                })
                .await
                .unwrap();
            handles.push(pending);
        }
        assert_eq!(coordinator.pending_count().await.unwrap(), 4);
        assert_eq!(coordinator.cancel_all_updates().await.unwrap(), 4);
        assert_eq!(coordinator.pending_count().await.unwrap(), 0);
        for (i, pending) in handles.into_iter().enumerate() {
            assert_eq!(pending.outcome().await, UpdateOutcome::Cancelled { superseded: false });
            let key = format!("k{}", i);
            assert_eq!(coordinator.current_value(&key).await.unwrap(), Some(i as i64));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_retry_sleep() {
        let coordinator = OptimisticUpdateCoordinator::new(RetryConfig::background());
        let calls = Arc::new(AtomicU32::new(0));
        let pending = coordinator
            .perform_update("k", 1, 0, counted(&calls, Err(ClientError::http(503, "busy"))))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        coordinator.cancel_update("k").await.unwrap();
        assert_eq!(pending.outcome().await, UpdateOutcome::Cancelled { superseded: false });

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_confirmed_value_is_cached() {
        let store = Arc::new(MemoryLocalStore::new());
        let coordinator: OptimisticUpdateCoordinator<serde_json::Value> =
            OptimisticUpdateCoordinator::with_store(RetryConfig::test(), store.clone(), CancellationToken::new());

        let pending = coordinator
            .perform_update(
                "post/42",
                serde_json::json!({"id": 42, "title": "draft"}),
                serde_json::json!({"id": 42, "title": "old"}),
                || async { Ok::<_, ClientError>(serde_json::json!({"id": 42, "title": "saved"})) },
            )
            .await
            .unwrap();
        assert!(pending.outcome().await.is_confirmed());

        let cached = store.get(&"post/42".parse().unwrap()).unwrap();
        assert_eq!(cached.payload["title"], "saved");
        assert_eq!(store.writes(WriteScope::Optimistic), 1);
    }
}
