//! Clock abstraction for testable time handling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// A source of wall-clock time.
///
/// Event timestamps, check intervals and the event writer's staleness flush
/// all read time through this trait so tests can control it.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Waits for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Returns the current time as Unix seconds.
    fn unix(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Fake clock for testing with controllable time.
///
/// `sleep` advances the clock by the requested duration and yields, so loops
/// that poll on a fixed interval make progress deterministically.
#[derive(Debug, Clone)]
pub struct FakeClock {
    current: Arc<Mutex<DateTime<Utc>>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl FakeClock {
    /// Creates a fake clock frozen at the given time.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        *self.current.lock() += delta;
    }

    /// Set the clock to a specific time.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.current.lock() = now;
    }

    /// Returns every duration passed to `sleep`, in order.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fake_clock_advance() {
        let start = Utc.with_ymd_and_hms(1991, 6, 3, 5, 30, 0).unwrap();
        let clock = FakeClock::new(start);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
        assert_eq!(clock.unix(), start.timestamp() + 90);
    }

    #[tokio::test]
    async fn test_fake_clock_sleep_advances() {
        let start = Utc.with_ymd_and_hms(1991, 6, 3, 5, 30, 0).unwrap();
        let clock = FakeClock::new(start);
        clock.sleep(Duration::from_secs(1)).await;
        clock.sleep(Duration::from_secs(1)).await;
        assert_eq!(clock.now(), start + chrono::Duration::seconds(2));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1); 2]);
    }
}
