// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Device-side persistence.
//!
//! [`LocalStore`] is the entity cache; [`TombstoneStore`] holds synchronization
//! state. Both are injected as `Arc<dyn _>` so the host app can plug in its own
//! database; memory and SQLite implementations ship with the crate.

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::{MemoryLocalStore, MemoryTombstoneStore};
pub use sqlite::SqliteTombstoneStore;
pub use traits::{EntityCriteria, IdSelector, LocalStore, StoreError, TombstoneStore, WriteScope};
