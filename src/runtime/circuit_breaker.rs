// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit breaker pattern implementation for resilient remote calls.
//!
//! The circuit breaker prevents hammering a failing dependency by
//! short-circuiting calls after repeated failures and letting a single probe
//! through once the recovery timeout has passed.
//!
//! # States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Requests immediately fail with `BreakerOpen` (dependency is down)
//! - **Half-Open**: A probe is testing whether the dependency has recovered
//!
//! # Example
//!
//! ```
//! use resilient_invoke::error::{InvokeError, RemoteError};
//! use resilient_invoke::runtime::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new()
//!         .with_failure_threshold(5)
//!         .with_recovery_timeout(Duration::from_secs(60)),
//! );
//!
//! let result = breaker
//!     .call(|| async { Ok::<_, InvokeError<RemoteError>>("pong") })
//!     .await;
//! assert_eq!(result.unwrap(), "pong");
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::events::{default_listener, ResilienceEvent, SharedListener};
use crate::error::InvokeError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally.
    Closed,
    /// Circuit is open, requests fail immediately.
    Open,
    /// Circuit is half-open, testing if the dependency has recovered.
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by the metrics gauge (0=closed, 1=half-open, 2=open).
    #[must_use]
    pub fn as_gauge(self) -> u64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: usize,
    /// Number of successful probes in half-open state before closing.
    pub success_threshold: usize,
    /// Time since the last failure after which an open circuit admits a probe.
    pub recovery_timeout: Duration,
    /// Maximum number of concurrent probes in half-open state.
    pub half_open_max_requests: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold for recovery.
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the recovery timeout.
    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Set the maximum half-open requests.
    #[must_use]
    pub fn with_half_open_max_requests(mut self, max: usize) -> Self {
        self.half_open_max_requests = max;
        self
    }
}

/// Everything the state machine mutates; guarded by one mutex.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: usize,
    last_failure_time: Option<Instant>,
    half_open_in_flight: usize,
    half_open_successes: usize,
    /// Bumped on every entry into half-open so stale probes cannot free new slots.
    generation: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            half_open_in_flight: 0,
            half_open_successes: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.half_open_in_flight = 0;
        self.half_open_successes = 0;
        match to {
            CircuitState::HalfOpen => self.generation += 1,
            CircuitState::Closed => {
                self.failure_count = 0;
                self.last_failure_time = None;
            }
            CircuitState::Open => {}
        }
        Some((from, to))
    }

    fn release_probe(&mut self, generation: u64) {
        if self.state == CircuitState::HalfOpen && self.generation == generation {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// How a call was let through.
#[derive(Debug, Clone, Copy)]
enum Admission {
    Normal,
    Probe { generation: u64 },
}

/// Releases a half-open probe slot if the call future is dropped before completing.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Admission::Probe { generation } = self.admission {
                self.breaker.lock().release_probe(generation);
            }
        }
    }
}

/// Circuit breaker for protecting against cascading failures.
///
/// The circuit breaker tracks consecutive failures and opens the circuit
/// when the failure threshold is reached, rejecting further calls until
/// the recovery timeout has elapsed since the last failure.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    listener: SharedListener,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState::new()),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            listener: default_listener(),
        }
    }

    /// Create a circuit breaker with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Route events to `listener` instead of the default tracing listener.
    #[must_use]
    pub fn with_listener(mut self, listener: SharedListener) -> Self {
        self.listener = listener;
        self
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_transition(&self, transition: Option<(CircuitState, CircuitState)>) {
        if let Some((from, to)) = transition {
            self.listener
                .on_event(&ResilienceEvent::BreakerTransition { from, to });
        }
    }

    /// Get the current circuit state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Check whether a call made now would be let through.
    #[must_use]
    pub fn can_execute(&self) -> bool {
        let st = self.lock();
        match st.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.recovery_elapsed(&st),
            CircuitState::HalfOpen => st.half_open_in_flight < self.config.half_open_max_requests,
        }
    }

    fn recovery_elapsed(&self, st: &BreakerState) -> bool {
        st.last_failure_time
            .is_none_or(|at| at.elapsed() > self.config.recovery_timeout)
    }

    fn admit(&self) -> Result<Admission, Option<Duration>> {
        let mut st = self.lock();
        let mut transition = None;
        let admission = match st.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                if self.recovery_elapsed(&st) {
                    transition = st.transition(CircuitState::HalfOpen);
                    st.half_open_in_flight = 1;
                    Ok(Admission::Probe {
                        generation: st.generation,
                    })
                } else {
                    Err(st.last_failure_time.map(|at| {
                        self.config.recovery_timeout.saturating_sub(at.elapsed())
                    }))
                }
            }
            CircuitState::HalfOpen => {
                if st.half_open_in_flight < self.config.half_open_max_requests {
                    st.half_open_in_flight += 1;
                    Ok(Admission::Probe {
                        generation: st.generation,
                    })
                } else {
                    Err(None)
                }
            }
        };
        drop(st);
        self.emit_transition(transition);
        admission
    }

    /// Execute an async operation with circuit breaker protection.
    ///
    /// The operation is invoked at most once. Cancellations are not counted
    /// as failures.
    ///
    /// # Errors
    ///
    /// Returns `InvokeError::BreakerOpen` without invoking the operation if the
    /// circuit is open (or the half-open probe slots are taken).
    /// Returns the operation's error if it fails.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, InvokeError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, InvokeError<E>>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let admission = match self.admit() {
            Ok(admission) => admission,
            Err(retry_after) => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                self.listener
                    .on_event(&ResilienceEvent::BreakerRejected { retry_after });
                return Err(InvokeError::BreakerOpen { retry_after });
            }
        };

        let mut guard = ProbeGuard {
            breaker: self,
            admission,
            armed: true,
        };
        let result = operation().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.on_success(admission),
            Err(InvokeError::Cancelled) => {
                if let Admission::Probe { generation } = admission {
                    self.lock().release_probe(generation);
                }
            }
            Err(_) => self.on_failure(admission),
        }
        result
    }

    /// Record a successful operation.
    fn on_success(&self, admission: Admission) {
        let mut st = self.lock();
        let mut transition = None;
        match st.state {
            CircuitState::Closed => {
                st.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                if let Admission::Probe { generation } = admission {
                    if generation == st.generation {
                        st.half_open_in_flight = st.half_open_in_flight.saturating_sub(1);
                        st.half_open_successes += 1;
                        if st.half_open_successes >= self.config.success_threshold {
                            transition = st.transition(CircuitState::Closed);
                        }
                    }
                }
            }
            // A call admitted before the circuit opened; its success proves nothing
            // about the probe schedule.
            CircuitState::Open => {}
        }
        drop(st);
        self.emit_transition(transition);
    }

    /// Record a failed operation.
    fn on_failure(&self, admission: Admission) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut st = self.lock();
        st.failure_count += 1;
        st.last_failure_time = Some(Instant::now());

        let transition = match st.state {
            CircuitState::Closed if st.failure_count >= self.config.failure_threshold => {
                st.transition(CircuitState::Open)
            }
            CircuitState::Closed | CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if let Admission::Probe { generation } = admission {
                    st.release_probe(generation);
                }
                st.transition(CircuitState::Open)
            }
        };
        drop(st);
        self.emit_transition(transition);
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut st = self.lock();
        let transition = st.transition(CircuitState::Closed);
        st.failure_count = 0;
        st.last_failure_time = None;
        drop(st);
        self.emit_transition(transition);
    }

    /// Get the time until an open circuit admits a probe.
    ///
    /// `None` unless the circuit is open.
    #[must_use]
    pub fn time_until_retry(&self) -> Option<Duration> {
        let st = self.lock();
        if st.state != CircuitState::Open {
            return None;
        }
        Some(
            st.last_failure_time
                .map_or(Duration::ZERO, |at| {
                    self.config.recovery_timeout.saturating_sub(at.elapsed())
                }),
        )
    }

    /// Get the current consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.lock().failure_count
    }

    /// When the most recent failure was recorded.
    #[must_use]
    pub fn last_failure_time(&self) -> Option<Instant> {
        self.lock().last_failure_time
    }

    /// Get total number of calls.
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Get total number of failures.
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Get total number of rejections (circuit open).
    #[must_use]
    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 to 1.0).
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.total_calls.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let failures = self.total_failures.load(Ordering::Relaxed);
        failures as f64 / total as f64
    }

    /// Get the circuit breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}
