// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the consistency engine.

use chrono::{DateTime, Utc};

/// Engine lifecycle state.
///
/// Use [`super::ConsistencyEngine::state()`] to check the current state or
/// [`super::ConsistencyEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, no background work running
    Created,
    /// Tickers running, accepting work
    Running,
    /// Shutdown requested; background work is being stopped
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Point-in-time view of the engine, for diagnostics screens and health checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub active_channels: usize,
    /// Local deletions not yet acknowledged by the server
    pub pending_tombstones: usize,
    pub unresolved_conflicts: usize,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl EngineStatus {
    /// Nothing waiting to reach the server and nothing waiting on the user.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.pending_tombstones == 0 && self.unresolved_conflicts == 0
    }
}
