// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: start and shutdown.

use tracing::{info, warn};

use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::schedule::Ticker;

use super::{ConsistencyEngine, EngineState};

impl ConsistencyEngine {
    fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Launch the background tickers and move to `Running`.
    ///
    /// Tickers, each skipped when its interval is zero:
    /// 1. stale channel sweep (`channel_sweep_interval_secs`)
    /// 2. periodic sync (`sync_interval_secs`)
    /// 3. tombstone retention cleanup (`cleanup_interval_secs`)
    #[tracing::instrument(skip(self))]
    pub fn start(&self) -> SyncResult<()> {
        match self.state() {
            EngineState::Created => {}
            EngineState::Running => return Ok(()),
            EngineState::ShuttingDown => {
                return Err(SyncError::validation("engine has been shut down"));
            }
        }

        let mut tasks = self.tasks.lock();

        if let Some(period) = self.config.channel_sweep_interval() {
            tasks.push(
                self.channels
                    .spawn_stale_sweeper(period, self.config.channel_max_age(), self.shutdown.child_token()),
            );
        }

        if let Some(period) = self.config.sync_interval() {
            let job = self.sync_job();
            tasks.push(Ticker::new("tombstone_sync", period).spawn(self.shutdown.child_token(), move || {
                let job = job.clone();
                async move {
                    if let Err(e) = job.run().await {
                        warn!(error = %e, "Scheduled sync failed, will retry next tick");
                    }
                }
            }));
        }

        if let Some(period) = self.config.cleanup_interval() {
            let tombstones = std::sync::Arc::clone(&self.tombstones);
            tasks.push(Ticker::new("tombstone_cleanup", period).spawn(self.shutdown.child_token(), move || {
                let tombstones = std::sync::Arc::clone(&tombstones);
                async move {
                    if let Err(e) = tombstones.cleanup_expired().await {
                        warn!(error = %e, "Tombstone cleanup failed");
                    }
                }
            }));
        }

        let tickers = tasks.len();
        drop(tasks);
        self.set_state(EngineState::Running);
        info!(tickers, "Consistency engine running");
        Ok(())
    }

    /// Stop tickers, watchers and in-flight retries, then close every
    /// realtime channel. Safe to call more than once.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.state() == EngineState::ShuttingDown {
            return;
        }
        info!("Shutting down consistency engine");
        self.set_state(EngineState::ShuttingDown);
        self.shutdown.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        }

        match self.channels.unsubscribe_all().await {
            Ok(closed) => info!(closed, "Realtime channels closed"),
            Err(e) => warn!(error = %e, "Failed to close realtime channels"),
        }
        info!("Consistency engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::remote::{Filter, MemoryRemote, RemoteOp};
    use crate::storage::MemoryLocalStore;
    use std::sync::Arc;
    use std::time::Duration;

    async fn engine(config: EngineConfig, remote: &MemoryRemote) -> ConsistencyEngine {
        ConsistencyEngine::connect(config, Arc::new(remote.clone()), Arc::new(MemoryLocalStore::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let remote = MemoryRemote::new();
        let engine = engine(EngineConfig::immediate(), &remote).await;
        let mut states = engine.state_receiver();
        assert_eq!(engine.state(), EngineState::Created);

        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), EngineState::Running);

        engine.start().unwrap();
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::ShuttingDown);
        assert!(engine.start().is_err());
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_ticker_runs() {
        let remote = MemoryRemote::new();
        let config = EngineConfig {
            sync_interval_secs: 60,
            ..EngineConfig::immediate()
        };
        let engine = engine(config, &remote).await;
        engine.start().unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(remote.calls(RemoteOp::Select), 1);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(remote.calls(RemoteOp::Select), 2);

        engine.shutdown().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(remote.calls(RemoteOp::Select), 2);
    }

    #[tokio::test]
    async fn test_rewatch_drops_finished_watchers() {
        let remote = MemoryRemote::new();
        let engine = engine(EngineConfig::immediate(), &remote).await;
        engine.start().unwrap();

        for _ in 0..5 {
            engine.watch("posts", &Filter::all()).await.unwrap();
            assert!(engine.unwatch("posts", &Filter::all()).await.unwrap());
            let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
            while !engine.tasks.lock().iter().all(|t| t.is_finished()) {
                assert!(tokio::time::Instant::now() < deadline, "watcher did not stop after unwatch");
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        engine.watch("posts", &Filter::all()).await.unwrap();
        assert_eq!(engine.tasks.lock().len(), 1);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_channels() {
        let remote = MemoryRemote::new();
        let engine = engine(EngineConfig::immediate(), &remote).await;
        engine.start().unwrap();

        engine.watch("posts", &Filter::all()).await.unwrap();
        engine.watch("comments", &Filter::all()).await.unwrap();
        assert_eq!(remote.open_channels(), 2);

        engine.shutdown().await;
        assert_eq!(remote.open_channels(), 0);
        assert_eq!(remote.closed_channels(), 2);
    }
}
