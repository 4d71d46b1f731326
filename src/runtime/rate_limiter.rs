// SPDX-License-Identifier: MIT OR Apache-2.0

//! Start-to-start spacing between remote calls.
//!
//! The limiter guarantees that no two call starts are closer together than
//! `min_interval`. Each caller reserves the next free start slot under a short
//! lock and then sleeps until that slot, so waiting never holds the lock and
//! never polls.
//!
//! # Example
//!
//! ```
//! use resilient_invoke::runtime::{RateLimiter, RateLimiterConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_millis(10)));
//! limiter.acquire().await;
//! limiter.acquire().await; // starts at least 10ms after the first
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::{default_listener, ResilienceEvent, SharedListener};
use crate::error::InvokeError;

/// Configuration for the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Minimum time between two successive call starts.
    pub min_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
        }
    }
}

impl RateLimiterConfig {
    /// Require at least `min_interval` between call starts. Zero disables pacing.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval }
    }

    /// No spacing at all.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Spacing derived from a maximum number of call starts per second.
    ///
    /// Returns `None` for non-finite or non-positive rates.
    /// `None` here is not "unlimited"; use [`unlimited`](Self::unlimited) for that.
    #[must_use]
    pub fn from_rps(rps: f64) -> Option<Self> {
        if !rps.is_finite() || rps <= 0.0 {
            return None;
        }
        // `as` saturates, so absurdly small rates become Duration::from_nanos(u64::MAX).
        Some(Self::new(Duration::from_nanos((1e9 / rps).round() as u64)))
    }
}

/// Enforces a minimum spacing between successive call starts.
pub struct RateLimiter {
    config: RateLimiterConfig,
    last_start: Mutex<Option<Instant>>,
    listener: SharedListener,
}

impl RateLimiter {
    /// Create a limiter that reports events through the default tracing listener.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            last_start: Mutex::new(None),
            listener: default_listener(),
        }
    }

    /// Route events to `listener` instead of the default tracing listener.
    #[must_use]
    pub fn with_listener(mut self, listener: SharedListener) -> Self {
        self.listener = listener;
        self
    }

    #[must_use]
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.config.min_interval
    }

    fn lock(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_start.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the next start slot and record it as the last start.
    fn reserve(&self) -> Instant {
        let mut last = self.lock();
        let now = Instant::now();
        let slot = match *last {
            Some(previous) => now.max(previous + self.config.min_interval),
            None => now,
        };
        *last = Some(slot);
        slot
    }

    /// Wait until a call may start, then record that start.
    ///
    /// Returns the time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let slot = self.reserve();
        let wait = slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            self.listener.on_event(&ResilienceEvent::RateLimited { wait });
            tokio::time::sleep_until(slot).await;
        }
        wait
    }

    /// Like [`acquire`](Self::acquire), but gives up when `token` is cancelled.
    ///
    /// A cancelled wait keeps its reserved slot, so the spacing invariant still
    /// holds for whoever comes next.
    ///
    /// # Errors
    ///
    /// Returns `InvokeError::Cancelled` if the token fires before the slot.
    pub async fn acquire_with_cancel<E>(
        &self,
        token: &CancellationToken,
    ) -> Result<Duration, InvokeError<E>> {
        if token.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }
        let slot = self.reserve();
        let wait = slot.saturating_duration_since(Instant::now());
        if wait.is_zero() {
            return Ok(wait);
        }

        self.listener.on_event(&ResilienceEvent::RateLimited { wait });
        tokio::select! {
            () = tokio::time::sleep_until(slot) => Ok(wait),
            () = token.cancelled() => {
                self.listener.on_event(&ResilienceEvent::Cancelled { stage: "rate_limit" });
                Err(InvokeError::Cancelled)
            }
        }
    }

    /// Record a start only if it would not have to wait.
    pub fn try_acquire(&self) -> bool {
        let mut last = self.lock();
        let now = Instant::now();
        match *last {
            Some(previous) if now < previous + self.config.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// How long a caller arriving now would wait.
    #[must_use]
    pub fn time_until_ready(&self) -> Duration {
        match *self.lock() {
            Some(previous) => {
                (previous + self.config.min_interval).saturating_duration_since(Instant::now())
            }
            None => Duration::ZERO,
        }
    }

    /// The most recently recorded (or reserved) start.
    #[must_use]
    pub fn last_start(&self) -> Option<Instant> {
        *self.lock()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("last_start", &self.last_start())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::runtime::events::EventRecorder;
    use std::sync::Arc;

    #[test]
    fn test_config_from_rps() {
        let config = RateLimiterConfig::from_rps(10.0).unwrap();
        assert_eq!(config.min_interval, Duration::from_millis(100));

        assert!(RateLimiterConfig::from_rps(0.0).is_none());
        assert!(RateLimiterConfig::from_rps(-1.0).is_none());
        assert!(RateLimiterConfig::from_rps(f64::NAN).is_none());
        assert!(RateLimiterConfig::from_rps(f64::INFINITY).is_none());
    }

    #[test]
    fn test_config_default() {
        assert_eq!(
            RateLimiterConfig::default().min_interval,
            Duration::from_millis(100)
        );
        assert_eq!(RateLimiterConfig::unlimited().min_interval, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_does_not_wait() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_secs(1)));
        assert_eq!(limiter.time_until_ready(), Duration::ZERO);
        assert_eq!(limiter.acquire().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_spacing() {
        let interval = Duration::from_millis(250);
        let limiter = RateLimiter::new(RateLimiterConfig::new(interval));

        let mut starts = Vec::new();
        for _ in 0..5 {
            limiter.acquire().await;
            starts.push(Instant::now());
        }

        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_spacing() {
        let interval = Duration::from_millis(100);
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::new(interval)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }

        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap());
        }
        starts.sort();

        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_interval_means_no_wait() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_millis(50)));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(limiter.acquire().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_millis(50)));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert!(limiter.time_until_ready() > Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_emits_event() {
        let recorder = Arc::new(EventRecorder::new());
        let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_millis(40)))
            .with_listener(recorder.clone());

        limiter.acquire().await;
        let waited = limiter.acquire().await;

        assert_eq!(waited, Duration::from_millis(40));
        assert_eq!(
            recorder.events(),
            vec![ResilienceEvent::RateLimited {
                wait: Duration::from_millis(40)
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_cancelled() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_secs(60)));
        let token = CancellationToken::new();
        limiter.acquire().await;

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = limiter.acquire_with_cancel::<RemoteError>(&token).await;
        assert!(matches!(result, Err(InvokeError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = RateLimiter::new(RateLimiterConfig::unlimited());
        for _ in 0..10 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
    }
}
