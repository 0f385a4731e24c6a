// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote backend boundary.
//!
//! The engine talks to the server through [`RemoteClient`]: row operations on
//! named tables plus filtered realtime subscriptions. [`MemoryRemote`] is the
//! in-process implementation used by tests and demos.

pub mod memory;
pub mod traits;

pub use memory::{MemoryRemote, RemoteOp};
pub use traits::{
    compare_values, ChangeEvent, ChangeKind, ChannelHandle, ClientError, Condition, Filter, FilterOp, Order,
    RemoteClient, Subscription, TransportKind, FOREIGN_KEY_VIOLATION, NOT_FOUND, PERMISSION_DENIED,
    SERVER_STAMP_COLUMN, UNIQUE_VIOLATION,
};
