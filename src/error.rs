// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy shared by every component.
//!
//! Each layer has its own `thiserror` enum ([`ClientError`](crate::remote::ClientError),
//! [`StoreError`](crate::storage::StoreError), [`RetryError`](crate::resilience::RetryError));
//! all of them map onto a single [`ErrorClass`] through the [`Classify`] trait,
//! which is what retry and reconciliation decisions are made on.

use thiserror::Error;

use crate::remote::ClientError;
use crate::resilience::RetryError;
use crate::storage::StoreError;

/// Result type for engine-level operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// How a failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Timeouts, DNS failures, lost connections, offline, 5xx. Retryable.
    TransientNetwork,
    /// Permission denied, constraint violations, not found. Never retried.
    PermanentRejection,
    /// The caller's input was malformed. Never retried.
    Validation,
    /// Delete-vs-update or optimistic-vs-server divergence. Resolved by policy.
    Conflict,
    /// Aborted by the caller or superseded.
    Cancelled,
    /// Could not be classified.
    Unknown,
}

impl ErrorClass {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::PermanentRejection => "permanent_rejection",
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an error onto the shared taxonomy.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Errors surfaced by the engine's public operations.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Retry(RetryError<ClientError>),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Stopped by shutdown (or another cancellation) before it finished.
    #[error("operation cancelled")]
    Cancelled,

    /// The actor task behind a component handle is gone.
    #[error("{0} is no longer running")]
    ActorStopped(&'static str),
}

impl SyncError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<RetryError<ClientError>> for SyncError {
    fn from(err: RetryError<ClientError>) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Retry(err)
        }
    }
}

impl Classify for SyncError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Client(e) => e.class(),
            Self::Store(e) => e.class(),
            Self::Retry(e) => e.class(),
            Self::Validation(_) => ErrorClass::Validation,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::ActorStopped(_) => ErrorClass::Unknown,
        }
    }
}
