// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff, jitter and cancellation.
//!
//! Every network operation in the crate goes through a [`RetryExecutor`].
//! Failures are classified before each retry (see [`Classify`]): transient
//! network errors are retried, rejections fail immediately, and unclassified
//! errors are retried only for operations declared [`Idempotency::Idempotent`].
//!
//! # Example
//!
//! ```
//! use offline_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Interactive: user is waiting, give up quickly
//! let interactive = RetryConfig::interactive();
//! assert_eq!(interactive.max_attempts, 3);
//!
//! // Background: sync and sweeps can afford to wait
//! let background = RetryConfig::background();
//! assert_eq!(background.max_attempts, 5);
//!
//! // Backoff without jitter is deterministic
//! let config = RetryConfig { jitter: false, ..RetryConfig::interactive() };
//! assert_eq!(config.delay_for_attempt(0), Duration::from_millis(200));
//! assert_eq!(config.delay_for_attempt(1), Duration::from_millis(400));
//! assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Classify, ErrorClass};
use crate::metrics;

/// Configuration for operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::interactive()`] - user-facing calls (the default)
/// - [`RetryConfig::background()`] - sync, sweeps, anything off the UI path
/// - [`RetryConfig::startup()`] - opening local databases
/// - [`RetryConfig::test()`] - zero delays
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total invocations, including the first. Values below 1 are treated as 1.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Scale each delay by a uniform random factor in [0.75, 1.25].
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::interactive()
    }
}

impl RetryConfig {
    /// 3 attempts, 200ms doubling up to 5s.
    #[must_use]
    pub fn interactive() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// 5 attempts, 1s doubling up to 60s.
    #[must_use]
    pub fn background() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Fast-fail retry for opening local resources at startup.
    /// 5 attempts, failing after a few seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// A single attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::test()
        }
    }

    /// 3 attempts with no delay between them.
    #[must_use]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// `min(initial_delay * multiplier^attempt, max_delay)`, attempt 0-indexed.
    #[must_use]
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// [`base_delay_for_attempt`](Self::base_delay_for_attempt) with jitter applied.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
        base.mul_f64(factor)
    }
}

/// Whether repeating an operation is safe when the failure is unclassified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Idempotency {
    /// Reads, upserts on a natural key, deletes by key.
    #[default]
    Idempotent,
    /// Plain inserts and other writes that could duplicate on replay.
    NonIdempotent,
}

/// Terminal failure of a retried operation.
#[derive(Error, Debug)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("{operation} rejected ({class}) after {attempts} attempt(s): {source}")]
    Rejected {
        operation: String,
        attempts: u32,
        class: ErrorClass,
        #[source]
        source: E,
    },

    #[error("{operation} cancelled after {attempts} attempt(s)")]
    Cancelled { operation: String, attempts: u32 },

    #[error("{operation} timed out after {elapsed:?}")]
    TimedOut { operation: String, elapsed: Duration },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// Invocations made before giving up. Unknown for timeouts.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Exhausted { attempts, .. } | Self::Rejected { attempts, .. } | Self::Cancelled { attempts, .. } => {
                Some(*attempts)
            }
            Self::TimedOut { .. } => None,
        }
    }

    /// The last underlying failure, if the operation ever returned one.
    #[must_use]
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { source, .. } | Self::Rejected { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } | Self::Rejected { source, .. } => Some(source),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl<E: std::error::Error + Classify + 'static> Classify for RetryError<E> {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Exhausted { source, .. } => source.class(),
            Self::Rejected { class, .. } => *class,
            Self::Cancelled { .. } => ErrorClass::Cancelled,
            Self::TimedOut { .. } => ErrorClass::TransientNetwork,
        }
    }
}

/// Per-call bookkeeping. Lives for one `execute` call.
#[derive(Debug, Default)]
struct RetryState {
    attempt: u32,
    last_error: Option<String>,
    next_delay: Option<Duration>,
}

/// Runs operations under a [`RetryConfig`] and a cancellation token.
///
/// Cloning shares the token: cancelling any clone cancels them all. Use
/// [`child`](Self::child) for a scope that can be cancelled on its own.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
    cancel: CancellationToken,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancellation(config: RetryConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Same policy, with a token that is cancelled when this one is (but not vice versa).
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            config: self.config.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Interrupt every in-flight attempt and backoff sleep on this executor.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Retry decision for a failure of `class`.
    #[must_use]
    pub fn should_retry(class: ErrorClass, idempotency: Idempotency) -> bool {
        match class {
            ErrorClass::TransientNetwork => true,
            ErrorClass::Unknown => idempotency == Idempotency::Idempotent,
            ErrorClass::PermanentRejection | ErrorClass::Validation | ErrorClass::Conflict | ErrorClass::Cancelled => {
                false
            }
        }
    }

    /// Run an idempotent operation.
    pub async fn execute<F, Fut, T, E>(&self, operation: &str, op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + 'static,
    {
        self.execute_with(operation, Idempotency::Idempotent, op).await
    }

    /// Run an operation with an explicit idempotency declaration.
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        operation: &str,
        idempotency: Idempotency,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + 'static,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut state = RetryState::default();

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled(operation, &state));
            }
            state.attempt += 1;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled(operation, &state)),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => {
                    if state.attempt > 1 {
                        info!(
                            operation,
                            attempts = state.attempt,
                            "Operation succeeded after retries"
                        );
                    }
                    metrics::record_retry_outcome(operation, "success");
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = err.class();
            metrics::record_retry_attempt(operation, class);
            state.last_error = Some(err.to_string());

            if class == ErrorClass::Cancelled {
                return Err(self.cancelled(operation, &state));
            }

            if !Self::should_retry(class, idempotency) {
                debug!(operation, attempt = state.attempt, %class, error = %err, "Not retrying");
                metrics::record_retry_outcome(operation, "rejected");
                return Err(RetryError::Rejected {
                    operation: operation.to_string(),
                    attempts: state.attempt,
                    class,
                    source: err,
                });
            }

            if state.attempt >= max_attempts {
                warn!(
                    operation,
                    attempts = state.attempt,
                    error = %err,
                    "Operation failed, retries exhausted"
                );
                metrics::record_retry_outcome(operation, "exhausted");
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: state.attempt,
                    source: err,
                });
            }

            let delay = self.config.delay_for_attempt(state.attempt - 1);
            state.next_delay = Some(delay);
            warn!(
                operation,
                attempt = state.attempt,
                max_attempts,
                %class,
                error = ?state.last_error,
                delay = ?state.next_delay,
                "Operation failed, retrying"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled(operation, &state)),
                _ = sleep(delay) => {}
            }
        }
    }

    /// Race the whole retrying operation against `deadline`; the loser is dropped.
    pub async fn execute_with_timeout<F, Fut, T, E>(
        &self,
        operation: &str,
        deadline: Duration,
        idempotency: Idempotency,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Classify + 'static,
    {
        let started = Instant::now();
        match tokio::time::timeout(deadline, self.execute_with(operation, idempotency, op)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, ?deadline, "Operation timed out");
                metrics::record_retry_outcome(operation, "timed_out");
                Err(RetryError::TimedOut {
                    operation: operation.to_string(),
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    fn cancelled<E: std::error::Error + 'static>(&self, operation: &str, state: &RetryState) -> RetryError<E> {
        debug!(operation, attempts = state.attempt, "Operation cancelled");
        metrics::record_retry_outcome(operation, "cancelled");
        RetryError::Cancelled {
            operation: operation.to_string(),
            attempts: state.attempt,
        }
    }
}
