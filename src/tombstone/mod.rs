// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Soft deletion and its propagation across devices.

mod synchronizer;
mod types;

pub use synchronizer::TombstoneSynchronizer;
pub use types::{
    ConflictResolution, ConflictStrategy, PullCursor, ReconcileOutcome, SyncConflict, SyncReport, Tombstone,
    TombstoneConfig, TOMBSTONE_CONFLICT_KEY,
};
