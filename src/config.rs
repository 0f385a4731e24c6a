// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the consistency engine.
//!
//! # Example
//!
//! ```
//! use offline_sync::EngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = EngineConfig::default();
//! assert_eq!(config.tombstone_retention_days, 30);
//! assert_eq!(config.batch_chunk_size, 500);
//!
//! // From JSON, overriding a few fields
//! let config: EngineConfig = serde_json::from_str(r#"{
//!     "sync_interval_secs": 0,
//!     "conflict_strategy": "deletion_wins",
//!     "conflict_notify_recipients": ["moderator-1"]
//! }"#).unwrap();
//! assert!(config.sync_interval().is_none());
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::resilience::RetryConfig;
use crate::tombstone::{ConflictStrategy, TombstoneConfig};

/// Configuration for the consistency engine.
///
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// SQLite file for tombstones, watermark and conflicts. In memory when unset.
    #[serde(default)]
    pub sqlite_path: Option<String>,

    /// Remote table holding tombstones
    #[serde(default = "default_tombstone_table")]
    pub tombstone_table: String,
    #[serde(default = "default_tombstone_push_batch_size")]
    pub tombstone_push_batch_size: usize,
    #[serde(default = "default_tombstone_pull_page_size")]
    pub tombstone_pull_page_size: usize,
    #[serde(default = "default_tombstone_retention_days")]
    pub tombstone_retention_days: u64,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    /// Who hears about conflicts left for manual resolution. Empty disables.
    #[serde(default)]
    pub conflict_notify_recipients: Vec<String>,

    /// Periodic sync in seconds (0 = disabled)
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Tombstone retention sweep in seconds (0 = disabled)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Channels at least this old are recycled by the sweep
    #[serde(default = "default_channel_max_age_secs")]
    pub channel_max_age_secs: u64,
    /// Stale channel sweep in seconds (0 = disabled)
    #[serde(default = "default_channel_sweep_interval_secs")]
    pub channel_sweep_interval_secs: u64,
    #[serde(default = "default_channel_event_capacity")]
    pub channel_event_capacity: usize,

    #[serde(default = "default_batch_chunk_size")]
    pub batch_chunk_size: usize,
    #[serde(default = "default_batch_max_in_flight")]
    pub batch_max_in_flight: usize,

    /// Retry policy for user-facing calls (optimistic updates, subscriptions)
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Retry policy for background sync and batch work
    #[serde(default = "default_sync_retry_max_attempts")]
    pub sync_retry_max_attempts: u32,
    #[serde(default = "default_sync_retry_initial_delay_ms")]
    pub sync_retry_initial_delay_ms: u64,
    #[serde(default = "default_sync_retry_max_delay_ms")]
    pub sync_retry_max_delay_ms: u64,

    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: bool,
}

fn default_tombstone_table() -> String { "deleted_records".to_string() }
fn default_tombstone_push_batch_size() -> usize { 100 }
fn default_tombstone_pull_page_size() -> usize { 500 }
fn default_tombstone_retention_days() -> u64 { 30 }
fn default_sync_interval_secs() -> u64 { 300 }
fn default_cleanup_interval_secs() -> u64 { 24 * 60 * 60 }
fn default_channel_max_age_secs() -> u64 { 60 * 60 }
fn default_channel_sweep_interval_secs() -> u64 { 5 * 60 }
fn default_channel_event_capacity() -> usize { 256 }
fn default_batch_chunk_size() -> usize { 500 }
fn default_batch_max_in_flight() -> usize { 4 }
fn default_retry_max_attempts() -> u32 { 3 }
fn default_retry_initial_delay_ms() -> u64 { 200 }
fn default_retry_max_delay_ms() -> u64 { 5_000 }
fn default_sync_retry_max_attempts() -> u32 { 5 }
fn default_sync_retry_initial_delay_ms() -> u64 { 1_000 }
fn default_sync_retry_max_delay_ms() -> u64 { 60_000 }
fn default_retry_jitter() -> bool { true }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sqlite_path: None,
            tombstone_table: default_tombstone_table(),
            tombstone_push_batch_size: default_tombstone_push_batch_size(),
            tombstone_pull_page_size: default_tombstone_pull_page_size(),
            tombstone_retention_days: default_tombstone_retention_days(),
            conflict_strategy: ConflictStrategy::default(),
            conflict_notify_recipients: Vec::new(),
            sync_interval_secs: default_sync_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            channel_max_age_secs: default_channel_max_age_secs(),
            channel_sweep_interval_secs: default_channel_sweep_interval_secs(),
            channel_event_capacity: default_channel_event_capacity(),
            batch_chunk_size: default_batch_chunk_size(),
            batch_max_in_flight: default_batch_max_in_flight(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            sync_retry_max_attempts: default_sync_retry_max_attempts(),
            sync_retry_initial_delay_ms: default_sync_retry_initial_delay_ms(),
            sync_retry_max_delay_ms: default_sync_retry_max_delay_ms(),
            retry_jitter: default_retry_jitter(),
        }
    }
}

fn interval(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl EngineConfig {
    /// Zero retry delays and no background tickers. Used by tests and demos.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            sync_interval_secs: 0,
            cleanup_interval_secs: 0,
            channel_sweep_interval_secs: 0,
            retry_initial_delay_ms: 0,
            retry_max_delay_ms: 0,
            sync_retry_max_attempts: 3,
            sync_retry_initial_delay_ms: 0,
            sync_retry_max_delay_ms: 0,
            retry_jitter: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn interactive_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter: self.retry_jitter,
            ..RetryConfig::interactive()
        }
    }

    #[must_use]
    pub fn background_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.sync_retry_max_attempts,
            initial_delay: Duration::from_millis(self.sync_retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.sync_retry_max_delay_ms),
            jitter: self.retry_jitter,
            ..RetryConfig::background()
        }
    }

    #[must_use]
    pub fn tombstone_config(&self) -> TombstoneConfig {
        TombstoneConfig {
            table: self.tombstone_table.clone(),
            push_batch_size: self.tombstone_push_batch_size,
            pull_page_size: self.tombstone_pull_page_size,
            retention: self.tombstone_retention(),
            strategy: self.conflict_strategy,
        }
    }

    #[must_use]
    pub fn tombstone_retention(&self) -> Duration {
        Duration::from_secs(self.tombstone_retention_days.saturating_mul(24 * 60 * 60))
    }

    #[must_use]
    pub fn sync_interval(&self) -> Option<Duration> {
        interval(self.sync_interval_secs)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Option<Duration> {
        interval(self.cleanup_interval_secs)
    }

    #[must_use]
    pub fn channel_sweep_interval(&self) -> Option<Duration> {
        interval(self.channel_sweep_interval_secs)
    }

    #[must_use]
    pub fn channel_max_age(&self) -> Duration {
        Duration::from_secs(self.channel_max_age_secs)
    }
}
