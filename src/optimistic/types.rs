// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::remote::{ClientError, FOREIGN_KEY_VIOLATION, NOT_FOUND, PERMISSION_DENIED, UNIQUE_VIOLATION};

/// Why a server operation behind an optimistic update failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Network,
    Authorization,
    Conflict,
    Validation,
    Server,
    Unknown,
}

impl FailureKind {
    #[must_use]
    pub fn from_error(error: &ClientError) -> Self {
        match error {
            ClientError::Transport { .. } => Self::Network,
            ClientError::Http { status, .. } => match *status {
                401 | 403 => Self::Authorization,
                409 => Self::Conflict,
                400 | 404 | 422 => Self::Validation,
                408 | 429 => Self::Network,
                500..=599 => Self::Server,
                _ => Self::Unknown,
            },
            ClientError::Database { code, .. } => match code.as_str() {
                PERMISSION_DENIED => Self::Authorization,
                UNIQUE_VIOLATION | FOREIGN_KEY_VIOLATION => Self::Conflict,
                NOT_FOUND => Self::Validation,
                _ => Self::Server,
            },
            ClientError::InvalidRequest(_) | ClientError::Decode(_) => Self::Validation,
            ClientError::Cancelled => Self::Unknown,
        }
    }

    /// Only network and server failures are worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::Server)
    }

    /// User-facing explanation shown after a rollback.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Network => "Couldn't reach the server. Your change was undone.",
            Self::Authorization => "You don't have permission to make this change.",
            Self::Conflict => "This item was changed somewhere else. Your change was undone.",
            Self::Validation => "The server rejected this change.",
            Self::Server => "The server had a problem saving your change.",
            Self::Unknown => "Something went wrong. Your change was undone.",
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Authorization => "authorization",
            Self::Conflict => "conflict",
            Self::Validation => "validation",
            Self::Server => "server",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one optimistic update. Each update resolves exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome<V> {
    /// The server accepted the change; `value` is what it returned.
    Confirmed { value: V },
    /// The change failed and the original value is visible again.
    RolledBack {
        kind: FailureKind,
        message: String,
        restored: V,
    },
    /// Dropped before completion, either replaced by a newer update for the
    /// same entity (`superseded`) or cancelled by the caller.
    Cancelled { superseded: bool },
}

impl<V> UpdateOutcome<V> {
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }

    #[must_use]
    pub fn is_rolled_back(&self) -> bool {
        matches!(self, Self::RolledBack { .. })
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Confirmed { .. } => "confirmed",
            Self::RolledBack { .. } => "rolled_back",
            Self::Cancelled { superseded: true } => "superseded",
            Self::Cancelled { superseded: false } => "cancelled",
        }
    }
}

/// Lifecycle notifications published by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent<V> {
    Applied {
        id: Uuid,
        entity_id: String,
        value: V,
    },
    Retrying {
        id: Uuid,
        entity_id: String,
        retry_count: u32,
        delay: Duration,
        kind: FailureKind,
    },
    Confirmed {
        id: Uuid,
        entity_id: String,
        value: V,
    },
    RolledBack {
        id: Uuid,
        entity_id: String,
        restored: V,
        kind: FailureKind,
        message: String,
    },
    Cancelled {
        id: Uuid,
        entity_id: String,
        superseded: bool,
    },
}

impl<V> UpdateEvent<V> {
    #[must_use]
    pub fn id(&self) -> Uuid {
        match self {
            Self::Applied { id, .. }
            | Self::Retrying { id, .. }
            | Self::Confirmed { id, .. }
            | Self::RolledBack { id, .. }
            | Self::Cancelled { id, .. } => *id,
        }
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        match self {
            Self::Applied { entity_id, .. }
            | Self::Retrying { entity_id, .. }
            | Self::Confirmed { entity_id, .. }
            | Self::RolledBack { entity_id, .. }
            | Self::Cancelled { entity_id, .. } => entity_id,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Applied { .. } | Self::Retrying { .. })
    }
}

/// Handle returned by `perform_update`: the value to show right away plus the
/// eventual outcome.
#[derive(Debug)]
pub struct PendingUpdate<V> {
    pub id: Uuid,
    pub entity_id: String,
    pub value: V,
    pub(crate) outcome: oneshot::Receiver<UpdateOutcome<V>>,
}

impl<V> PendingUpdate<V> {
    /// Wait for the terminal outcome.
    ///
    /// Resolves as a non-superseded cancellation if the coordinator shuts down
    /// first.
    pub async fn outcome(self) -> UpdateOutcome<V> {
        self.outcome.await.unwrap_or(UpdateOutcome::Cancelled { superseded: false })
    }

    /// Split off the outcome receiver, e.g. to hand it to another task.
    pub fn into_parts(self) -> (V, oneshot::Receiver<UpdateOutcome<V>>) {
        (self.value, self.outcome)
    }
}

/// Snapshot of an update still waiting on the server.
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub id: Uuid,
    pub entity_id: String,
    pub retry_count: u32,
    pub age: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::TransportKind;

    #[test]
    fn test_failure_kinds() {
        let kind = |e: ClientError| FailureKind::from_error(&e);
        assert_eq!(kind(ClientError::transport(TransportKind::Dns, "lookup failed")), FailureKind::Network);
        assert_eq!(kind(ClientError::http(503, "down")), FailureKind::Server);
        assert_eq!(kind(ClientError::http(429, "slow down")), FailureKind::Network);
        assert_eq!(kind(ClientError::http(403, "nope")), FailureKind::Authorization);
        assert_eq!(kind(ClientError::http(409, "stale")), FailureKind::Conflict);
        assert_eq!(kind(ClientError::http(422, "bad")), FailureKind::Validation);
        assert_eq!(kind(ClientError::database(PERMISSION_DENIED, "rls")), FailureKind::Authorization);
        assert_eq!(kind(ClientError::database(UNIQUE_VIOLATION, "dup")), FailureKind::Conflict);
        assert_eq!(kind(ClientError::Decode("eof".into())), FailureKind::Validation);
    }

    #[test]
    fn test_only_network_and_server_retry() {
        assert!(FailureKind::Network.is_retryable());
        assert!(FailureKind::Server.is_retryable());
        assert!(!FailureKind::Authorization.is_retryable());
        assert!(!FailureKind::Conflict.is_retryable());
        assert!(!FailureKind::Validation.is_retryable());
        assert!(!FailureKind::Unknown.is_retryable());
    }

    #[tokio::test]
    async fn test_dropped_sender_resolves_cancelled() {
        let (tx, rx) = oneshot::channel::<UpdateOutcome<i32>>();
        drop(tx);
        let pending = PendingUpdate {
            id: Uuid::new_v4(),
            entity_id: "post/1".into(),
            value: 1,
            outcome: rx,
        };
        assert_eq!(pending.outcome().await, UpdateOutcome::Cancelled { superseded: false });
    }
}
