//! Waiting for an instant measured on an authoritative clock

use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::error::Result;

/// A source of the shared time all participants schedule against
#[async_trait]
pub trait AuthoritativeClock: Send + Sync {
    /// Current authoritative instant
    ///
    /// # Errors
    ///
    /// Returns an error if the clock cannot be read, e.g. a clock query that
    /// times out.
    async fn now(&self) -> Result<SystemTime>;

    /// Longest single sleep before the clock is read again
    fn max_sleep_slice(&self) -> Duration {
        Duration::MAX
    }
}

/// The local system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl AuthoritativeClock for SystemClock {
    async fn now(&self) -> Result<SystemTime> {
        Ok(SystemTime::now())
    }
}

/// Time left from `now` until `target`, zero if `target` has passed
#[must_use]
pub fn remaining_wait(target: SystemTime, now: SystemTime) -> Duration {
    target.duration_since(now).unwrap_or(Duration::ZERO)
}

/// Sleep until `clock` reads at or past `target`
///
/// Returns immediately when the target is already in the past. Long waits
/// are split into slices of at most `clock.max_sleep_slice()`, re-reading the
/// clock between slices.
///
/// # Errors
///
/// Propagates the first error from reading `clock`.
pub async fn wait_until<C>(clock: &C, target: SystemTime) -> Result<Duration>
where
    C: AuthoritativeClock + ?Sized,
{
    let mut slept = Duration::ZERO;

    loop {
        let now = clock.now().await?;
        let remaining = remaining_wait(target, now);
        if remaining.is_zero() {
            break;
        }

        let slice = remaining.min(clock.max_sleep_slice());
        tracing::trace!(remaining_ms = remaining.as_millis(), "Waiting for target instant");
        tokio::time::sleep(slice).await;
        slept += slice;
    }

    Ok(slept)
}
