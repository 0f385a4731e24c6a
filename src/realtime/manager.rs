// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Realtime channel lifecycle.
//!
//! The backend limits how many push channels one client may hold open, so
//! channels are deduplicated by (resource, filter) and recycled. The
//! [`ChannelLifecycleManager`] is a handle to an actor task that owns the
//! channel table; every mutation goes through its command queue.
//!
//! ```text
//! registered ──first event──> active ──┬── unsubscribe / teardown ──> closed
//!      └───────────────────────────────┴── age >= max_age sweep ────> closed
//! ```
//!
//! Each managed channel forwards its events into a `broadcast` channel, so a
//! caller who reuses an existing channel receives the same stream as the
//! caller who opened it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::remote::{ChangeEvent, ChannelHandle, Filter, RemoteClient, Subscription};
use crate::resilience::RetryExecutor;
use crate::schedule::Ticker;

const COMMAND_BUFFER: usize = 64;
const ACTOR_NAME: &str = "channel manager";

/// Dedup key: one live channel per (resource, filter).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub resource: String,
    pub filter: String,
}

impl ChannelKey {
    pub fn new(resource: &str, filter: &Filter) -> Self {
        Self {
            resource: resource.to_string(),
            filter: filter.to_string(),
        }
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}?{}", self.resource, self.filter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Stored, no event delivered yet.
    Registered,
    /// At least one event delivered.
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unsubscribed,
    Stale,
    Teardown,
    /// Lost a registration race against an existing channel.
    Duplicate,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Unsubscribed => "closed",
            Self::Stale => "stale_swept",
            Self::Teardown => "teardown",
            Self::Duplicate => "duplicate_closed",
        }
    }
}

/// Snapshot of one managed channel.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub key: ChannelKey,
    pub channel_id: String,
    pub state: ChannelState,
    pub age: Duration,
    pub receivers: usize,
}

/// A caller's view of a managed channel.
#[derive(Debug)]
pub struct ChannelSubscription {
    pub key: ChannelKey,
    pub channel_id: String,
    pub events: broadcast::Receiver<ChangeEvent>,
    /// True when an already-open channel was handed out.
    pub reused: bool,
}

struct ManagedChannel {
    handle: Arc<dyn ChannelHandle>,
    subscribed_at: Instant,
    events: broadcast::Sender<ChangeEvent>,
    forwarder: JoinHandle<()>,
    activated: Arc<AtomicBool>,
}

impl ManagedChannel {
    fn start(key: &ChannelKey, subscription: Subscription, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let activated = Arc::new(AtomicBool::new(false));

        let tx = events.clone();
        let flag = Arc::clone(&activated);
        let resource = key.resource.clone();
        let mut incoming = subscription.events;
        let forwarder = tokio::spawn(async move {
            while let Some(event) = incoming.recv().await {
                flag.store(true, Ordering::Release);
                metrics::record_realtime_change(&resource, event.kind.as_str());
                // No receivers is fine; the channel stays open for the next one.
                let _ = tx.send(event);
            }
            debug!(resource = %resource, "Channel stream ended");
        });

        Self {
            handle: subscription.handle,
            subscribed_at: Instant::now(),
            events,
            forwarder,
            activated,
        }
    }

    fn state(&self) -> ChannelState {
        if self.activated.load(Ordering::Acquire) {
            ChannelState::Active
        } else {
            ChannelState::Registered
        }
    }

    fn subscriber(&self, key: &ChannelKey, reused: bool) -> ChannelSubscription {
        ChannelSubscription {
            key: key.clone(),
            channel_id: self.handle.id().to_string(),
            events: self.events.subscribe(),
            reused,
        }
    }

    async fn close(self, key: &ChannelKey, reason: CloseReason) {
        self.forwarder.abort();
        self.handle.close().await;
        metrics::record_channel_event(reason.as_str());
        debug!(channel = %key, reason = reason.as_str(), "Channel closed");
    }
}

enum Command {
    Existing {
        key: ChannelKey,
        reply: oneshot::Sender<Option<ChannelSubscription>>,
    },
    Register {
        key: ChannelKey,
        subscription: Subscription,
        reply: oneshot::Sender<ChannelSubscription>,
    },
    Unsubscribe {
        key: ChannelKey,
        reply: oneshot::Sender<bool>,
    },
    CleanupStale {
        max_age: Duration,
        reply: oneshot::Sender<usize>,
    },
    UnsubscribeAll {
        reply: oneshot::Sender<usize>,
    },
    List {
        reply: oneshot::Sender<Vec<ChannelInfo>>,
    },
}

struct ChannelActor {
    channels: HashMap<ChannelKey, ManagedChannel>,
    event_capacity: usize,
}

impl ChannelActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        let closed = self.close_all(CloseReason::Teardown).await;
        if closed > 0 {
            info!(closed, "Channel manager dropped, closed remaining channels");
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Existing { key, reply } => {
                let found = self.channels.get(&key).map(|c| c.subscriber(&key, true));
                if found.is_some() {
                    metrics::record_channel_event("reused");
                }
                let _ = reply.send(found);
            }
            Command::Register { key, subscription, reply } => {
                let result = self.register(key, subscription).await;
                let _ = reply.send(result);
            }
            Command::Unsubscribe { key, reply } => {
                let removed = match self.channels.remove(&key) {
                    Some(channel) => {
                        channel.close(&key, CloseReason::Unsubscribed).await;
                        true
                    }
                    None => false,
                };
                self.publish_count();
                let _ = reply.send(removed);
            }
            Command::CleanupStale { max_age, reply } => {
                let stale: Vec<ChannelKey> = self
                    .channels
                    .iter()
                    .filter(|(_, c)| c.subscribed_at.elapsed() >= max_age)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in &stale {
                    if let Some(channel) = self.channels.remove(key) {
                        channel.close(key, CloseReason::Stale).await;
                    }
                }
                if !stale.is_empty() {
                    info!(closed = stale.len(), ?max_age, "Swept stale channels");
                }
                self.publish_count();
                let _ = reply.send(stale.len());
            }
            Command::UnsubscribeAll { reply } => {
                let closed = self.close_all(CloseReason::Teardown).await;
                let _ = reply.send(closed);
            }
            Command::List { reply } => {
                let mut infos: Vec<ChannelInfo> = self
                    .channels
                    .iter()
                    .map(|(key, c)| ChannelInfo {
                        key: key.clone(),
                        channel_id: c.handle.id().to_string(),
                        state: c.state(),
                        age: c.subscribed_at.elapsed(),
                        receivers: c.events.receiver_count(),
                    })
                    .collect();
                infos.sort_by(|a, b| a.key.cmp(&b.key));
                let _ = reply.send(infos);
            }
        }
    }

    async fn register(&mut self, key: ChannelKey, subscription: Subscription) -> ChannelSubscription {
        if let Some(existing) = self.channels.get(&key) {
            let result = existing.subscriber(&key, true);
            debug!(channel = %key, newcomer = subscription.handle.id(), "Duplicate registration, closing newcomer");
            subscription.handle.close().await;
            metrics::record_channel_event(CloseReason::Duplicate.as_str());
            return result;
        }

        let channel = ManagedChannel::start(&key, subscription, self.event_capacity);
        let result = channel.subscriber(&key, false);
        debug!(channel = %key, id = %result.channel_id, "Channel registered");
        metrics::record_channel_event("opened");
        self.channels.insert(key, channel);
        self.publish_count();
        result
    }

    async fn close_all(&mut self, reason: CloseReason) -> usize {
        let closed = self.channels.len();
        for (key, channel) in self.channels.drain() {
            channel.close(&key, reason).await;
        }
        self.publish_count();
        closed
    }

    fn publish_count(&self) {
        metrics::set_active_channels(self.channels.len());
    }
}

/// Handle to the channel actor. Cheap to clone; the actor stops (closing every
/// channel) when the last handle is dropped.
#[derive(Clone)]
pub struct ChannelLifecycleManager {
    commands: mpsc::Sender<Command>,
    executor: RetryExecutor,
}

impl ChannelLifecycleManager {
    /// Spawn the actor. Must be called inside a tokio runtime.
    pub fn new(executor: RetryExecutor, event_capacity: usize) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = ChannelActor {
            channels: HashMap::new(),
            event_capacity: event_capacity.max(1),
        };
        tokio::spawn(actor.run(rx));
        Self { commands, executor }
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> SyncResult<R> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SyncError::ActorStopped(ACTOR_NAME))?;
        rx.await.map_err(|_| SyncError::ActorStopped(ACTOR_NAME))
    }

    /// The live channel for (resource, filter), if any.
    pub async fn existing_channel(&self, resource: &str, filter: &Filter) -> SyncResult<Option<ChannelSubscription>> {
        let key = ChannelKey::new(resource, filter);
        self.request(|reply| Command::Existing { key, reply }).await
    }

    /// Store a freshly opened channel. If one already exists for the key, the
    /// newcomer is closed and the existing channel is returned instead.
    pub async fn register(
        &self,
        resource: &str,
        filter: &Filter,
        subscription: Subscription,
    ) -> SyncResult<ChannelSubscription> {
        let key = ChannelKey::new(resource, filter);
        self.request(|reply| Command::Register { key, subscription, reply }).await
    }

    /// Reuse the live channel for (resource, filter) or open and register one.
    #[tracing::instrument(skip(self, client, filter), fields(filter = %filter))]
    pub async fn subscribe(
        &self,
        client: &dyn RemoteClient,
        resource: &str,
        filter: &Filter,
    ) -> SyncResult<ChannelSubscription> {
        if let Some(existing) = self.existing_channel(resource, filter).await? {
            debug!(channel = %existing.key, "Reusing channel");
            return Ok(existing);
        }

        let subscription = self
            .executor
            .execute("realtime_subscribe", || client.subscribe(resource, filter))
            .await?;
        self.register(resource, filter, subscription).await
    }

    /// Close and forget one channel. Returns false if there was none.
    pub async fn unsubscribe(&self, resource: &str, filter: &Filter) -> SyncResult<bool> {
        let key = ChannelKey::new(resource, filter);
        self.request(|reply| Command::Unsubscribe { key, reply }).await
    }

    /// Close every channel whose age is at least `max_age`. Returns how many.
    pub async fn cleanup_stale(&self, max_age: Duration) -> SyncResult<usize> {
        self.request(|reply| Command::CleanupStale { max_age, reply }).await
    }

    /// Close every channel. All closes have completed when this returns.
    pub async fn unsubscribe_all(&self) -> SyncResult<usize> {
        self.request(|reply| Command::UnsubscribeAll { reply }).await
    }

    pub async fn channels(&self) -> SyncResult<Vec<ChannelInfo>> {
        self.request(|reply| Command::List { reply }).await
    }

    pub async fn active_count(&self) -> SyncResult<usize> {
        Ok(self.channels().await?.len())
    }

    /// Periodically run [`cleanup_stale`](Self::cleanup_stale) until `cancel` fires.
    pub fn spawn_stale_sweeper(&self, period: Duration, max_age: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        Ticker::new("channel_sweeper", period).spawn(cancel, move || {
            let manager = manager.clone();
            async move {
                if let Err(e) = manager.cleanup_stale(max_age).await {
                    warn!(error = %e, "Stale channel sweep failed");
                }
            }
        })
    }
}
