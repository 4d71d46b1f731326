// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policies and backoff strategies for fallible remote operations.
//!
//! [`RetryConfig::execute`] re-invokes an operation until it succeeds, the
//! policy refuses a failure, or the attempt budget is spent. On exhaustion the
//! **last** failure is returned as-is.
//!
//! # Example
//!
//! ```
//! use resilient_invoke::runtime::{ExponentialBackoff, RetryConfig};
//! use std::time::Duration;
//!
//! let retry = RetryConfig::builder()
//!     .max_retries(3)
//!     .backoff(ExponentialBackoff::new(Duration::from_secs(1)))
//!     .build();
//! assert_eq!(retry.max_retries, 3);
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::{default_listener, ResilienceEvent, SharedListener};
use crate::error::{sanitize_error_message, Classify, FailureKind, InvokeError};

/// Defines a backoff strategy for retry delays.
pub trait BackoffStrategy: Clone + Send + Sync + 'static {
    /// Calculate the delay before the next retry attempt.
    ///
    /// # Arguments
    /// * `attempt` - The retry index (0 for the first retry)
    fn delay(&self, attempt: u32) -> Duration;
}

// =============================================================================
// No Backoff
// =============================================================================

/// No delay between retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl NoBackoff {
    /// Create a new no-backoff strategy.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl BackoffStrategy for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

// =============================================================================
// Fixed Backoff
// =============================================================================

/// Fixed delay between retries.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    /// Create a new fixed backoff strategy.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Create a fixed backoff with delay in milliseconds.
    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl BackoffStrategy for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

// =============================================================================
// Linear Backoff
// =============================================================================

/// Linear backoff - delay increases linearly with each attempt.
#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    initial_delay: Duration,
    increment: Duration,
    max_delay: Duration,
}

impl LinearBackoff {
    /// Create a new linear backoff strategy.
    #[must_use]
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            increment: initial_delay,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Set the increment for each retry.
    #[must_use]
    pub fn with_increment(mut self, increment: Duration) -> Self {
        self.increment = increment;
        self
    }

    /// Set the maximum delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

impl BackoffStrategy for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_add(self.increment.saturating_mul(attempt));
        delay.min(self.max_delay)
    }
}

// =============================================================================
// Exponential Backoff
// =============================================================================

/// Exponential backoff: retry `k` waits `initial_delay * multiplier^k`.
///
/// Uncapped and jitter-free unless configured otherwise.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Option<Duration>,
    multiplier: f64,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Create a doubling backoff starting at `initial_delay`.
    #[must_use]
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: None,
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Set the maximum delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Set the multiplier for exponential growth.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Add up to 25% random jitter to every delay.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the first retry, before jitter and the cap apply.
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);

        if self.jitter {
            nanos += nanos * 0.25 * rand::random::<f64>();
        }
        // The cap bounds the jittered delay too.
        if let Some(max) = self.max_delay {
            nanos = nanos.min(max.as_nanos() as f64);
        }

        // `as` saturates on overflow and maps NaN to zero.
        Duration::from_nanos(nanos.round() as u64)
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Determines whether a failure should be retried.
pub trait RetryPolicy<E>: Clone + Send + Sync + 'static {
    /// Returns `true` if the operation should be retried after this error.
    fn should_retry(&self, error: &InvokeError<E>) -> bool;
}

/// Retries every operation failure and every timeout.
///
/// Breaker rejections and cancellations are never retried.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl<E> RetryPolicy<E> for DefaultRetryPolicy {
    fn should_retry(&self, error: &InvokeError<E>) -> bool {
        matches!(
            error,
            InvokeError::Operation(_) | InvokeError::DeadlineExceeded { .. }
        )
    }
}

/// Never retry - fail immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl<E> RetryPolicy<E> for NoRetryPolicy {
    fn should_retry(&self, _error: &InvokeError<E>) -> bool {
        false
    }
}

/// Retries only failures classified as [`FailureKind::Transient`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientOnlyPolicy;

impl<E: Classify> RetryPolicy<E> for TransientOnlyPolicy {
    fn should_retry(&self, error: &InvokeError<E>) -> bool {
        error.failure_kind() == FailureKind::Transient
    }
}

/// Retry policy backed by a predicate.
#[derive(Clone)]
pub struct CustomRetryPolicy<F> {
    predicate: F,
}

impl<F> CustomRetryPolicy<F> {
    /// Retry any failure for which `predicate` returns `true`.
    #[must_use]
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> fmt::Debug for CustomRetryPolicy<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomRetryPolicy")
    }
}

impl<E, F> RetryPolicy<E> for CustomRetryPolicy<F>
where
    F: Fn(&InvokeError<E>) -> bool + Clone + Send + Sync + 'static,
{
    fn should_retry(&self, error: &InvokeError<E>) -> bool {
        (self.predicate)(error)
    }
}

// =============================================================================
// Retry Configuration
// =============================================================================

/// Complete retry configuration combining policy and backoff.
#[derive(Clone)]
pub struct RetryConfig<P = DefaultRetryPolicy, B: BackoffStrategy = ExponentialBackoff> {
    /// Maximum number of attempts after the first one.
    pub max_retries: u32,
    /// Policy determining which errors to retry.
    pub policy: P,
    /// Backoff strategy for calculating delays.
    pub backoff: B,
    /// Maximum total time for all retries.
    pub total_timeout: Option<Duration>,
    listener: SharedListener,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            policy: DefaultRetryPolicy,
            backoff: ExponentialBackoff::default(),
            total_timeout: None,
            listener: default_listener(),
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> RetryConfigBuilder<DefaultRetryPolicy, ExponentialBackoff> {
        RetryConfigBuilder::new()
    }

    /// Disable retries.
    #[must_use]
    pub fn disabled() -> RetryConfig<NoRetryPolicy, NoBackoff> {
        RetryConfig {
            max_retries: 0,
            policy: NoRetryPolicy,
            backoff: NoBackoff,
            total_timeout: None,
            listener: default_listener(),
        }
    }
}

impl<P, B: BackoffStrategy> fmt::Debug for RetryConfig<P, B>
where
    P: fmt::Debug,
    B: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("policy", &self.policy)
            .field("backoff", &self.backoff)
            .field("total_timeout", &self.total_timeout)
            .finish_non_exhaustive()
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

impl<P, B: BackoffStrategy> RetryConfig<P, B> {
    /// Route events to `listener` instead of the default tracing listener.
    #[must_use]
    pub fn with_listener(mut self, listener: SharedListener) -> Self {
        self.listener = listener;
        self
    }

    /// Execute an async operation with retry logic.
    ///
    /// # Errors
    ///
    /// Returns the last failure once the policy refuses it or no attempts remain.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, InvokeError<E>>
    where
        P: RetryPolicy<E>,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InvokeError<E>>>,
    {
        self.run(None, operation).await
    }

    /// Like [`execute`](Self::execute), but stops as soon as `token` is cancelled,
    /// whether an attempt or a backoff sleep is in progress.
    ///
    /// # Errors
    ///
    /// Returns `InvokeError::Cancelled` on cancellation, otherwise as `execute`.
    pub async fn execute_with_cancel<T, E, F, Fut>(
        &self,
        token: &CancellationToken,
        operation: F,
    ) -> Result<T, InvokeError<E>>
    where
        P: RetryPolicy<E>,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InvokeError<E>>>,
    {
        self.run(Some(token), operation).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        token: Option<&CancellationToken>,
        mut operation: F,
    ) -> Result<T, InvokeError<E>>
    where
        P: RetryPolicy<E>,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InvokeError<E>>>,
    {
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if token.is_some_and(CancellationToken::is_cancelled) {
                return Err(self.cancel());
            }

            let outcome = tokio::select! {
                biased;
                () = cancelled(token) => return Err(self.cancel()),
                outcome = operation() => outcome,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(InvokeError::Cancelled) => return Err(InvokeError::Cancelled),
                Err(error) => error,
            };

            let attempts_made = attempt + 1;
            self.listener.on_event(&ResilienceEvent::AttemptFailed {
                attempt: attempts_made,
                kind: error.kind_label(),
                error: sanitize_error_message(&error.to_string()),
            });

            if !self.policy.should_retry(&error) {
                return Err(error);
            }

            let delay = self.backoff.delay(attempt);
            // A retry that could only start after the budget is not scheduled.
            let over_budget = self
                .total_timeout
                .is_some_and(|timeout| delay >= timeout.saturating_sub(start.elapsed()));
            if attempt >= self.max_retries || over_budget {
                self.listener.on_event(&ResilienceEvent::RetriesExhausted {
                    attempts: attempts_made,
                });
                return Err(error);
            }

            self.listener.on_event(&ResilienceEvent::RetryScheduled {
                attempt: attempts_made,
                delay,
            });
            tokio::select! {
                biased;
                () = cancelled(token) => return Err(self.cancel()),
                () = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    fn cancel<E>(&self) -> InvokeError<E> {
        self.listener
            .on_event(&ResilienceEvent::Cancelled { stage: "retry" });
        InvokeError::Cancelled
    }
}

/// Builder for `RetryConfig`.
#[derive(Clone)]
pub struct RetryConfigBuilder<P, B: BackoffStrategy> {
    max_retries: u32,
    policy: P,
    backoff: B,
    total_timeout: Option<Duration>,
    listener: SharedListener,
}

impl RetryConfigBuilder<DefaultRetryPolicy, ExponentialBackoff> {
    /// Create a new builder with defaults.
    #[must_use]
    pub fn new() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_retries: defaults.max_retries,
            policy: defaults.policy,
            backoff: defaults.backoff,
            total_timeout: defaults.total_timeout,
            listener: defaults.listener,
        }
    }
}

impl Default for RetryConfigBuilder<DefaultRetryPolicy, ExponentialBackoff> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, B: BackoffStrategy> RetryConfigBuilder<P, B> {
    /// Set maximum retry attempts.
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn policy<P2>(self, policy: P2) -> RetryConfigBuilder<P2, B> {
        RetryConfigBuilder {
            max_retries: self.max_retries,
            policy,
            backoff: self.backoff,
            total_timeout: self.total_timeout,
            listener: self.listener,
        }
    }

    /// Set the backoff strategy.
    #[must_use]
    pub fn backoff<B2: BackoffStrategy>(self, backoff: B2) -> RetryConfigBuilder<P, B2> {
        RetryConfigBuilder {
            max_retries: self.max_retries,
            policy: self.policy,
            backoff,
            total_timeout: self.total_timeout,
            listener: self.listener,
        }
    }

    /// Set the total timeout for all retries.
    #[must_use]
    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    /// Disable total timeout.
    #[must_use]
    pub fn no_total_timeout(mut self) -> Self {
        self.total_timeout = None;
        self
    }

    /// Route events to `listener`.
    #[must_use]
    pub fn listener(mut self, listener: SharedListener) -> Self {
        self.listener = listener;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> RetryConfig<P, B> {
        RetryConfig {
            max_retries: self.max_retries,
            policy: self.policy,
            backoff: self.backoff,
            total_timeout: self.total_timeout,
            listener: self.listener,
        }
    }
}
