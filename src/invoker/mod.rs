// SPDX-License-Identifier: MIT OR Apache-2.0

//! The composed client: rate limiter, circuit breaker, retry and timeout
//! wrapped around one operation.
//!
//! For one logical request the layers run in this order:
//!
//! ```text
//! caller -> RateLimiter -> CircuitBreaker -> RetryConfig -> ScopedTimeout -> operation
//! ```
//!
//! The breaker sits outside the retry loop, so a whole exhausted retry
//! sequence counts as a single breaker failure, and a rejected call is never
//! retried.
//!
//! # Example
//!
//! ```
//! use resilient_invoke::error::RemoteError;
//! use resilient_invoke::invoker::{InvokerConfig, ResilientInvoker};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let invoker = ResilientInvoker::new(
//!     InvokerConfig::new()
//!         .with_min_interval(Duration::ZERO)
//!         .with_max_retries(2),
//! );
//!
//! let invocation = invoker
//!     .invoke("ping", || async { Ok::<_, RemoteError>("pong") })
//!     .await;
//!
//! assert_eq!(invocation.attempts, 1);
//! assert_eq!(invocation.into_result().unwrap(), "pong");
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::ResilienceConfig;
use crate::error::InvokeError;
use crate::runtime::{
    default_listener, BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, DefaultRetryPolicy,
    ExponentialBackoff, InvocationSpan, ListenerSet, MetricsCollector, RateLimiter,
    RateLimiterConfig, RetryConfig, RetryPolicy, ScopedTimeout, SharedListener,
};

// =============================================================================
// Configuration
// =============================================================================

/// Runtime configuration for a [`ResilientInvoker`].
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    pub rate_limiter: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// Attempts after the first.
    pub max_retries: u32,
    pub backoff: ExponentialBackoff,
    /// Budget for the whole retry sequence.
    pub total_retry_timeout: Option<Duration>,
    /// Deadline for each attempt.
    pub timeout: Duration,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            rate_limiter: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            max_retries: 3,
            backoff: ExponentialBackoff::default(),
            total_retry_timeout: None,
            timeout: crate::runtime::DEFAULT_DEADLINE,
        }
    }
}

impl InvokerConfig {
    /// Create a new invoker configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum spacing between call starts.
    #[must_use]
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.rate_limiter = RateLimiterConfig::new(interval);
        self
    }

    /// Set the number of retries after the first attempt.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.backoff = ExponentialBackoff::new(delay);
        self
    }

    /// Replace the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the budget for a whole retry sequence.
    #[must_use]
    pub fn with_total_retry_timeout(mut self, timeout: Duration) -> Self {
        self.total_retry_timeout = Some(timeout);
        self
    }

    /// Set the deadline for each attempt.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the circuit breaker failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.circuit_breaker.failure_threshold = threshold;
        self
    }

    /// Set the circuit breaker recovery timeout.
    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.circuit_breaker.recovery_timeout = timeout;
        self
    }

    /// Replace the whole circuit breaker configuration.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }
}

impl From<&ResilienceConfig> for InvokerConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            rate_limiter: config.rate_limiter_config(),
            circuit_breaker: config.circuit_breaker_config(),
            max_retries: config.retry.max_retries,
            backoff: config.backoff(),
            total_retry_timeout: config.total_retry_timeout(),
            timeout: config.deadline(),
        }
    }
}

// =============================================================================
// Invocation record
// =============================================================================

/// Result of one logical invocation plus how it got there.
#[derive(Debug)]
pub struct Invocation<T, E> {
    /// Name the caller gave the operation.
    pub operation: String,
    /// The operation's value, or the error of whichever layer stopped the call.
    pub outcome: Result<T, InvokeError<E>>,
    /// Attempts actually started; 0 if the call never reached the operation.
    pub attempts: u32,
    /// Wall time from entering the invoker to the final outcome.
    pub elapsed: Duration,
    /// Time spent waiting for the rate limiter.
    pub rate_limit_wait: Duration,
}

impl<T, E> Invocation<T, E> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&InvokeError<E>> {
        self.outcome.as_ref().err()
    }

    /// Drop the metadata and keep the outcome.
    ///
    /// # Errors
    ///
    /// Returns the invocation's error, if it failed.
    pub fn into_result(self) -> Result<T, InvokeError<E>> {
        self.outcome
    }
}

// =============================================================================
// Invoker
// =============================================================================

/// A client that applies every resilience layer to the operations it runs.
///
/// Cloning is cheap; clones share the rate limiter and circuit breaker.
#[derive(Clone)]
pub struct ResilientInvoker<P = DefaultRetryPolicy, B: BackoffStrategy = ExponentialBackoff> {
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig<P, B>,
    timeout: ScopedTimeout,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ResilientInvoker {
    /// Create an invoker that logs events through `tracing`.
    #[must_use]
    pub fn new(config: InvokerConfig) -> Self {
        Self::builder(config).build()
    }

    /// Start building an invoker with custom listeners, metrics, backoff or
    /// retry policy.
    #[must_use]
    pub fn builder(
        config: InvokerConfig,
    ) -> ResilientInvokerBuilder<DefaultRetryPolicy, ExponentialBackoff> {
        ResilientInvokerBuilder {
            backoff: config.backoff,
            config,
            policy: DefaultRetryPolicy,
            listeners: ListenerSet::new(),
            metrics: None,
        }
    }
}

impl<P, B: BackoffStrategy> ResilientInvoker<P, B> {
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_config(&self) -> &RetryConfig<P, B> {
        &self.retry
    }

    pub fn timeout(&self) -> &ScopedTimeout {
        &self.timeout
    }

    pub fn metrics(&self) -> Option<&MetricsCollector> {
        self.metrics.as_deref()
    }

    /// Run `operation` through every layer.
    ///
    /// `operation` is called once per attempt and must build a fresh future
    /// each time.
    pub async fn invoke<T, E, F, Fut>(&self, operation: &str, op: F) -> Invocation<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, None, op).await
    }

    /// Like [`invoke`](Self::invoke), but stops at the next await point once
    /// `token` is cancelled, whether waiting for the rate limiter, running an
    /// attempt or sleeping between retries.
    pub async fn invoke_with_cancel<T, E, F, Fut>(
        &self,
        operation: &str,
        token: &CancellationToken,
        op: F,
    ) -> Invocation<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(operation, Some(token), op).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        token: Option<&CancellationToken>,
        mut op: F,
    ) -> Invocation<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let span = InvocationSpan::new(operation);
        let started = Instant::now();
        let attempts = AtomicU32::new(0);

        let (rate_limit_wait, outcome) = async {
            let wait = match token {
                Some(token) => match self.limiter.acquire_with_cancel(token).await {
                    Ok(wait) => wait,
                    Err(error) => return (Duration::ZERO, Err(error)),
                },
                None => self.limiter.acquire().await,
            };

            let attempt = || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.timeout.run_operation(op())
            };
            let outcome = self
                .breaker
                .call(move || async move {
                    match token {
                        Some(token) => self.retry.execute_with_cancel(token, attempt).await,
                        None => self.retry.execute(attempt).await,
                    }
                })
                .await;

            (wait, outcome)
        }
        .instrument(span.span().clone())
        .await;

        let elapsed = started.elapsed();
        let attempts = attempts.load(Ordering::Relaxed);
        let label = match &outcome {
            Ok(_) => {
                span.record_success(attempts, elapsed);
                "success"
            }
            Err(error) => {
                span.record_error(attempts, error, elapsed);
                error.kind_label()
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_invocation(operation, label, attempts, elapsed);
        }
        tracing::debug!(
            parent: span.span(),
            operation,
            attempts,
            outcome = label,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "invocation finished"
        );

        Invocation {
            operation: operation.to_string(),
            outcome,
            attempts,
            elapsed,
            rate_limit_wait,
        }
    }
}

impl<P, B: BackoffStrategy> fmt::Debug for ResilientInvoker<P, B>
where
    P: fmt::Debug,
    B: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientInvoker")
            .field("limiter", &self.limiter)
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ResilientInvoker`].
pub struct ResilientInvokerBuilder<P, B> {
    config: InvokerConfig,
    policy: P,
    backoff: B,
    listeners: ListenerSet,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<P, B: BackoffStrategy> ResilientInvokerBuilder<P, B> {
    /// Send events to `listener`. Replaces the default tracing listener;
    /// add a [`TracingListener`](crate::runtime::TracingListener) explicitly to keep it.
    #[must_use]
    pub fn listener(mut self, listener: SharedListener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Aggregate events and invocation outcomes into `metrics`.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Use a different retry policy.
    #[must_use]
    pub fn retry_policy<P2>(self, policy: P2) -> ResilientInvokerBuilder<P2, B> {
        ResilientInvokerBuilder {
            config: self.config,
            policy,
            backoff: self.backoff,
            listeners: self.listeners,
            metrics: self.metrics,
        }
    }

    /// Space retries with `backoff` instead of the configured exponential
    /// schedule.
    #[must_use]
    pub fn backoff<B2: BackoffStrategy>(self, backoff: B2) -> ResilientInvokerBuilder<P, B2> {
        ResilientInvokerBuilder {
            config: self.config,
            policy: self.policy,
            backoff,
            listeners: self.listeners,
            metrics: self.metrics,
        }
    }

    /// Build the invoker.
    #[must_use]
    pub fn build(self) -> ResilientInvoker<P, B> {
        let mut listeners = if self.listeners.is_empty() {
            ListenerSet::new().with(default_listener())
        } else {
            self.listeners
        };
        if let Some(metrics) = &self.metrics {
            listeners.push(metrics.clone());
        }
        let listener: SharedListener = Arc::new(listeners);

        let mut retry = RetryConfig::builder()
            .max_retries(self.config.max_retries)
            .backoff(self.backoff)
            .listener(listener.clone());
        if let Some(total) = self.config.total_retry_timeout {
            retry = retry.total_timeout(total);
        }

        ResilientInvoker {
            limiter: Arc::new(
                RateLimiter::new(self.config.rate_limiter).with_listener(listener.clone()),
            ),
            breaker: Arc::new(
                CircuitBreaker::new(self.config.circuit_breaker).with_listener(listener.clone()),
            ),
            retry: retry.policy(self.policy).build(),
            timeout: ScopedTimeout::new(self.config.timeout).with_listener(listener),
            metrics: self.metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::runtime::{CircuitState, EventRecorder, LinearBackoff, TransientOnlyPolicy};
    use crate::testkit::ScriptedOperation;

    fn fast_config() -> InvokerConfig {
        InvokerConfig::new()
            .with_min_interval(Duration::ZERO)
            .with_base_delay(Duration::from_millis(10))
    }

    #[test]
    fn test_invoker_config_default() {
        let config = InvokerConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.rate_limiter.min_interval, Duration::from_millis(100));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.backoff.initial_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_invoker_config_from_file_config() {
        let file = ResilienceConfig::from_yaml(
            "retry:\n  max_retries: 1\ntimeout:\n  deadline_ms: 500\nrate_limit:\n  min_interval_ms: 0\n",
        )
        .unwrap();
        let config = InvokerConfig::from(&file);

        assert_eq!(config.max_retries, 1);
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.rate_limiter.min_interval, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retries() {
        let op = ScriptedOperation::new(Ok(7))
            .repeat(2, Err(RemoteError::transient("throttled")));
        let invoker = ResilientInvoker::new(fast_config());

        let invocation = invoker.invoke("count", || op.call()).await;

        assert_eq!(invocation.attempts, 3);
        assert_eq!(invocation.value(), Some(&7));
        assert_eq!(invocation.operation, "count");
        assert_eq!(invocation.elapsed, Duration::from_millis(30));
        assert_eq!(invoker.circuit_breaker().failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_backoff_spaces_retries() {
        let op = ScriptedOperation::new(Ok(7))
            .repeat(3, Err(RemoteError::transient("throttled")));
        let invoker = ResilientInvoker::builder(fast_config())
            .backoff(LinearBackoff::new(Duration::from_millis(100)))
            .build();

        let invocation = invoker.invoke("count", || op.call()).await;

        assert_eq!(invocation.attempts, 4);
        assert_eq!(
            op.call_gaps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_gets_its_own_deadline() {
        let op: ScriptedOperation<&str, RemoteError> = ScriptedOperation::new(Ok("fast"))
            .then_after(Duration::from_secs(5), Ok("slow"));
        let invoker = ResilientInvoker::new(fast_config().with_timeout(Duration::from_secs(1)));

        let invocation = invoker.invoke("generate", || op.call()).await;

        assert_eq!(invocation.attempts, 2);
        assert_eq!(invocation.into_result().unwrap(), "fast");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_call_never_reaches_operation() {
        let op: ScriptedOperation<(), RemoteError> =
            ScriptedOperation::new(Err(RemoteError::transient("down")));
        let invoker = ResilientInvoker::new(
            fast_config()
                .with_max_retries(0)
                .with_failure_threshold(1),
        );

        let first = invoker.invoke("embed", || op.call()).await;
        assert_eq!(first.attempts, 1);
        assert_eq!(invoker.circuit_breaker().state(), CircuitState::Open);

        let second = invoker.invoke("embed", || op.call()).await;
        assert_eq!(second.attempts, 0);
        assert!(second.error().unwrap().is_breaker_open());
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failures_skip_retries() {
        let recorder = Arc::new(EventRecorder::new());
        let op: ScriptedOperation<(), RemoteError> =
            ScriptedOperation::new(Err(RemoteError::permanent("bad request")));
        let invoker = ResilientInvoker::builder(fast_config())
            .listener(recorder.clone())
            .retry_policy(TransientOnlyPolicy)
            .build();

        let invocation = invoker.invoke("validate", || op.call()).await;

        assert_eq!(invocation.attempts, 1);
        assert_eq!(recorder.count("retry_scheduled"), 0);
        assert_eq!(
            invocation
                .error()
                .and_then(InvokeError::operation_error)
                .map(|e| e.message.as_str()),
            Some("bad request")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_wait_is_reported() {
        let op: ScriptedOperation<(), RemoteError> = ScriptedOperation::new(Ok(()));
        let invoker = ResilientInvoker::new(
            fast_config().with_min_interval(Duration::from_millis(200)),
        );

        let first = invoker.invoke("ping", || op.call()).await;
        let second = invoker.invoke("ping", || op.call()).await;

        assert_eq!(first.rate_limit_wait, Duration::ZERO);
        assert_eq!(second.rate_limit_wait, Duration::from_millis(200));
        assert_eq!(op.call_gaps(), vec![Duration::from_millis(200)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let op: ScriptedOperation<(), RemoteError> =
            ScriptedOperation::new(Err(RemoteError::transient("flaky")));
        let invoker = ResilientInvoker::new(
            InvokerConfig::new()
                .with_min_interval(Duration::ZERO)
                .with_base_delay(Duration::from_secs(60)),
        );
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let invocation = invoker
            .invoke_with_cancel("generate", &token, || op.call())
            .await;

        assert!(invocation.error().unwrap().is_cancelled());
        assert_eq!(invocation.attempts, 1);
        assert_eq!(invocation.elapsed, Duration::from_secs(1));
        // Cancellation is not held against the dependency.
        assert_eq!(invoker.circuit_breaker().failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_are_recorded() {
        let metrics = Arc::new(MetricsCollector::with_defaults());
        let op = ScriptedOperation::new(Ok(1)).then(Err(RemoteError::transient("blip")));
        let invoker = ResilientInvoker::builder(fast_config())
            .metrics(metrics.clone())
            .build();

        let invocation = invoker.invoke("generate", || op.call()).await;
        assert!(invocation.is_success());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_invocations, 1);
        assert_eq!(snapshot.successful_invocations, 1);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.retries, 1);
        assert!(invoker.metrics().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_breaker() {
        let op: ScriptedOperation<(), RemoteError> =
            ScriptedOperation::new(Err(RemoteError::transient("down")));
        let invoker = ResilientInvoker::new(
            fast_config()
                .with_max_retries(0)
                .with_failure_threshold(2),
        );
        let clone = invoker.clone();

        let _ = invoker.invoke("a", || op.call()).await;
        let _ = clone.invoke("b", || op.call()).await;

        assert_eq!(invoker.circuit_breaker().state(), CircuitState::Open);
    }
}
