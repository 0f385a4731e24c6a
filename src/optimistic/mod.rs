// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local-first mutations reconciled against the server.

mod coordinator;
mod types;

pub use coordinator::{OptimisticUpdateCoordinator, ServerOperation};
pub use types::{FailureKind, PendingInfo, PendingUpdate, UpdateEvent, UpdateOutcome};
