// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic background work.
//!
//! A [`Ticker`] drives an async job from a `tokio::time::interval`, racing each
//! wait against a [`CancellationToken`] so shutdown never waits for the next
//! tick. Missed ticks are skipped rather than bursted.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// `tokio::time::interval` panics on a zero period.
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct Ticker {
    name: &'static str,
    period: Duration,
}

impl Ticker {
    #[must_use]
    pub fn new(name: &'static str, period: Duration) -> Self {
        if period.is_zero() {
            warn!(ticker = name, "Zero ticker period, clamping to {:?}", MIN_PERIOD);
        }
        Self {
            name,
            period: period.max(MIN_PERIOD),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run `job` every period until `cancel` fires.
    ///
    /// The first run happens one full period after spawning. A job that is
    /// still running when the token fires is allowed to finish.
    pub fn spawn<F, Fut>(self, cancel: CancellationToken, mut job: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;

            debug!(ticker = self.name, period = ?self.period, "Ticker started");
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => job().await,
                }
            }
            debug!(ticker = self.name, "Ticker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_period_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let c = Arc::clone(&count);
        let handle = Ticker::new("test", Duration::from_secs(10)).spawn(cancel.clone(), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_period_is_clamped() {
        let ticker = Ticker::new("zero", Duration::ZERO);
        assert_eq!(ticker.period(), MIN_PERIOD);
        assert_eq!(ticker.name(), "zero");
    }
}
