// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for offline-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host app is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `offline_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `component`: retry, tombstone, realtime, optimistic, batch, engine
//! - `operation`: the operation name passed to the retry executor
//! - `class`: error class (see [`ErrorClass`])

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::error::ErrorClass;

/// Record one failed attempt that the executor looked at.
pub fn record_retry_attempt(operation: &str, class: ErrorClass) {
    counter!(
        "offline_sync_retry_attempts_total",
        "operation" => operation.to_string(),
        "class" => class.as_str()
    )
    .increment(1);
}

/// Record how a retried call ended: success, exhausted, rejected, cancelled, timed_out
pub fn record_retry_outcome(operation: &str, outcome: &'static str) {
    counter!(
        "offline_sync_retry_outcomes_total",
        "operation" => operation.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "offline_sync_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_tombstones_pushed(count: usize) {
    counter!("offline_sync_tombstones_pushed_total").increment(count as u64);
}

pub fn record_tombstone_push_failure(count: usize) {
    counter!("offline_sync_tombstone_push_failures_total").increment(count as u64);
}

pub fn record_tombstones_pulled(count: usize) {
    counter!("offline_sync_tombstones_pulled_total").increment(count as u64);
}

pub fn record_deletions_applied(source: &'static str, count: usize) {
    counter!(
        "offline_sync_deletions_applied_total",
        "source" => source
    )
    .increment(count as u64);
}

pub fn record_tombstones_purged(count: usize) {
    counter!("offline_sync_tombstones_purged_total").increment(count as u64);
}

/// Set the number of local tombstones waiting for push
pub fn set_pending_tombstones(count: usize) {
    gauge!("offline_sync_pending_tombstones").set(count as f64);
}

/// Record a detected delete-vs-update conflict and how it was settled
pub fn record_conflict(strategy: &'static str, outcome: &'static str) {
    counter!(
        "offline_sync_conflicts_total",
        "strategy" => strategy,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a channel lifecycle event: opened, reused, duplicate_closed, closed, stale_swept
pub fn record_channel_event(event: &'static str) {
    counter!(
        "offline_sync_channel_events_total",
        "event" => event
    )
    .increment(1);
}

pub fn set_active_channels(count: usize) {
    gauge!("offline_sync_active_channels").set(count as f64);
}

/// Record a server-origin change received over realtime
pub fn record_realtime_change(table: &str, kind: &'static str) {
    counter!(
        "offline_sync_realtime_changes_total",
        "table" => table.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record an optimistic update outcome: applied, retrying, confirmed, rolled_back, cancelled
pub fn record_optimistic_event(event: &'static str) {
    counter!(
        "offline_sync_optimistic_events_total",
        "event" => event
    )
    .increment(1);
}

pub fn set_pending_updates(count: usize) {
    gauge!("offline_sync_pending_updates").set(count as f64);
}

/// Record one processed batch chunk
pub fn record_batch_chunk(operation: &str, items: usize, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "offline_sync_batch_chunks_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "offline_sync_batch_chunk_items",
        "operation" => operation.to_string()
    )
    .record(items as f64);
}

pub fn record_sync_duration(duration: Duration) {
    histogram!("offline_sync_sync_seconds").record(duration.as_secs_f64());
}

/// Record a push notification dispatch
pub fn record_notification(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "offline_sync_notifications_total",
        "status" => status
    )
    .increment(1);
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "offline_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($component:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($component, $op)
    };
}
