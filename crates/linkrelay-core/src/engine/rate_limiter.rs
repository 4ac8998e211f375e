//! Leaky-bucket rate limiter for a single transfer
//!
//! Tracks bytes written against wall-clock time since the start of the
//! current window. Whenever the average rate runs ahead of the allocated
//! share, the limiter sleeps until the average is back on target, so an
//! early burst is paid back later instead of being capped per chunk.
//!
//! Time comes from a [`Clock`], which keeps the limiter free of any
//! particular I/O call and lets tests drive it with a [`ManualClock`].

use crate::engine::rate_governor::RateShare;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Monotonic time source with the ability to suspend
#[async_trait]
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin
    fn now(&self) -> Duration;

    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the tokio timer
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock: `sleep` advances time instantly
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    elapsed: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward without sleeping, as if work took `duration`
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.elapsed.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Average-rate limiter bound to one transfer's [`RateShare`]
pub struct RateLimiter {
    share: RateShare,
    clock: Arc<dyn Clock>,
    /// Limit the current window was opened with
    window_limit: u64,
    window_start: Duration,
    window_bytes: u64,
    /// Totals since the limiter was created, for reporting
    started_at: Duration,
    total_bytes: u64,
}

impl RateLimiter {
    pub fn new(share: RateShare, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            window_limit: share.get(),
            share,
            clock,
            window_start: now,
            window_bytes: 0,
            started_at: now,
            total_bytes: 0,
        }
    }

    /// Account for `bytes` just written and sleep if the average rate is
    /// above the current share. Returns the time spent sleeping.
    pub async fn consume(&mut self, bytes: u64) -> Duration {
        self.total_bytes += bytes;

        let limit = self.share.get();
        if limit != self.window_limit {
            // Reallocated: measure the new share from here on
            self.window_limit = limit;
            self.window_start = self.clock.now();
            self.window_bytes = 0;
        }
        self.window_bytes += bytes;

        if limit == 0 {
            return Duration::ZERO;
        }

        let elapsed = self.clock.now().saturating_sub(self.window_start);
        let target = Duration::from_secs_f64(self.window_bytes as f64 / limit as f64);
        if target <= elapsed {
            return Duration::ZERO;
        }

        let wait = target - elapsed;
        self.clock.sleep(wait).await;
        wait
    }

    /// Bytes per second averaged since the limiter was created
    pub fn observed_rate(&self) -> u64 {
        let elapsed = self.clock.now().saturating_sub(self.started_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (self.total_bytes as f64 / elapsed) as u64
    }

    /// Limit currently applied, 0 when unthrottled
    pub fn current_limit(&self) -> u64 {
        self.share.get()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: u64) -> (RateLimiter, ManualClock, RateShare) {
        let clock = ManualClock::new();
        let share = RateShare::new(rate);
        let limiter = RateLimiter::new(share.clone(), Arc::new(clock.clone()));
        (limiter, clock, share)
    }

    #[tokio::test]
    async fn test_rate_limiter_basic() {
        let (mut limiter, clock, _) = limiter(1000); // 1KB/s

        let waited = limiter.consume(500).await;
        assert_eq!(waited, Duration::from_millis(500));

        limiter.consume(500).await;
        assert_eq!(clock.now(), Duration::from_secs(1));
        assert_eq!(limiter.observed_rate(), 1000);
    }

    #[tokio::test]
    async fn test_slow_source_is_not_delayed() {
        let (mut limiter, clock, _) = limiter(1000);

        clock.advance(Duration::from_secs(2));
        let waited = limiter.consume(1000).await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_burst_is_compensated_later() {
        let (mut limiter, clock, _) = limiter(1000);

        // Source stalls for a second, then delivers three seconds worth at once
        clock.advance(Duration::from_secs(1));
        limiter.consume(3000).await;

        // Average is brought back to 1000 B/s overall
        assert_eq!(clock.now(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_rate_limiter_unlimited() {
        let (mut limiter, clock, _) = limiter(0);

        for _ in 0..100 {
            assert_eq!(limiter.consume(10000).await, Duration::ZERO);
        }
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_reallocation_restarts_window() {
        let (mut limiter, clock, share) = limiter(1000);

        limiter.consume(1000).await;
        assert_eq!(clock.now(), Duration::from_secs(1));

        // A second transfer was admitted: this one now gets half
        share.set(500);
        limiter.consume(1000).await;
        assert_eq!(clock.now(), Duration::from_secs(3));
        assert_eq!(limiter.current_limit(), 500);
    }

    #[tokio::test]
    async fn test_system_clock_sleeps() {
        tokio::time::pause();
        let clock = SystemClock::new();
        clock.sleep(Duration::from_secs(5)).await;
        assert!(clock.now() >= Duration::from_secs(5));
    }
}
