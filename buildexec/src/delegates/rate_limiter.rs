//! Smoothing of periodic resource checks.

use crate::cancellation::CancellationToken;
use crate::errors::Result;
use crate::utils::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Spreads scheduled checks over time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Waits for the next free slot. Fails if `ctx` is cancelled first.
    async fn wait(&self, ctx: &CancellationToken) -> Result<()>;
}

/// Never waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn wait(&self, ctx: &CancellationToken) -> Result<()> {
        ctx.check()
    }
}

/// Hands out at most one slot per `spacing`, shared by every caller.
pub struct IntervalRateLimiter {
    spacing: Duration,
    clock: Arc<dyn Clock>,
    next_slot: Mutex<Option<DateTime<Utc>>>,
}

impl IntervalRateLimiter {
    /// Allows `checks_per_second` checks per second. Zero or less disables limiting.
    #[must_use]
    pub fn per_second(checks_per_second: f64, clock: Arc<dyn Clock>) -> Self {
        let spacing = if checks_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / checks_per_second)
        } else {
            Duration::ZERO
        };
        Self::new(spacing, clock)
    }

    /// Allows one check per `spacing`.
    #[must_use]
    pub fn new(spacing: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            spacing,
            clock,
            next_slot: Mutex::new(None),
        }
    }

    /// Reserves the next slot and returns how long to wait for it.
    fn reserve(&self) -> Duration {
        let now = self.clock.now();
        let spacing = chrono::Duration::from_std(self.spacing).unwrap_or_else(|_| chrono::Duration::zero());

        let mut next = self.next_slot.lock();
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + spacing);

        (slot - now).to_std().unwrap_or_default()
    }
}

impl std::fmt::Debug for IntervalRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalRateLimiter")
            .field("spacing", &self.spacing)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RateLimiter for IntervalRateLimiter {
    async fn wait(&self, ctx: &CancellationToken) -> Result<()> {
        if self.spacing.is_zero() {
            return ctx.check();
        }

        let delay = self.reserve();
        if !delay.is_zero() {
            tokio::select! {
                () = self.clock.sleep(delay) => {}
                () = ctx.cancelled() => {}
            }
        }
        ctx.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::FakeClock;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn clock() -> FakeClock {
        FakeClock::new(Utc.with_ymd_and_hms(1991, 6, 3, 5, 30, 0).unwrap())
    }

    #[tokio::test]
    async fn test_slots_are_spaced() {
        let clock = clock();
        let limiter = IntervalRateLimiter::per_second(2.0, Arc::new(clock.clone()));
        let ctx = CancellationToken::new();

        for _ in 0..3 {
            limiter.wait(&ctx).await.unwrap();
        }

        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(500), Duration::from_millis(500)]
        );
    }

    #[tokio::test]
    async fn test_zero_rate_never_waits() {
        let clock = clock();
        let limiter = IntervalRateLimiter::per_second(0.0, Arc::new(clock.clone()));
        let ctx = CancellationToken::new();

        limiter.wait(&ctx).await.unwrap();
        limiter.wait(&ctx).await.unwrap();
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_wait_errors() {
        let limiter = NoopRateLimiter;
        let ctx = CancellationToken::new();
        ctx.cancel("shutting down");
        assert!(limiter.wait(&ctx).await.unwrap_err().is_cancelled());
    }
}
