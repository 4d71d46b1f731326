// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured resilience events.
//!
//! Every primitive reports what it does (waits, failed attempts, breaker
//! transitions, fired deadlines, failed disposals) as a [`ResilienceEvent`]
//! delivered to a [`ResilienceListener`]. The core never decides where events
//! end up; [`TracingListener`] forwards them to `tracing`, [`EventRecorder`]
//! keeps them in memory, and the metrics collector aggregates them.
//!
//! # Example
//!
//! ```
//! use resilient_invoke::runtime::{LogLevel, LoggingConfig, TracingListener};
//!
//! let listener = TracingListener::with_config(
//!     LoggingConfig::new().with_event_level(LogLevel::Trace),
//! );
//! assert_eq!(listener.config().event_level, LogLevel::Trace);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::circuit_breaker::CircuitState;

const EVENT_TARGET: &str = "resilient_invoke::events";

/// Something observable that happened inside a resilience primitive.
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    /// A caller had to wait for the rate limiter.
    RateLimited { wait: Duration },
    /// An attempt failed (1-based attempt number).
    AttemptFailed {
        attempt: u32,
        kind: &'static str,
        error: String,
    },
    /// A retry will start after `delay`; `attempt` is the attempt that just failed.
    RetryScheduled { attempt: u32, delay: Duration },
    /// No attempts remain; the last failure is returned to the caller.
    RetriesExhausted { attempts: u32 },
    /// The circuit breaker changed state.
    BreakerTransition { from: CircuitState, to: CircuitState },
    /// The circuit breaker refused a call without running it.
    BreakerRejected { retry_after: Option<Duration> },
    /// A scoped timeout fired.
    TimeoutFired { deadline: Duration },
    /// A caller cancellation interrupted the named stage.
    Cancelled { stage: &'static str },
    /// A disposer failed; the failure was swallowed.
    DisposalFailed { label: String, error: String },
}

impl ResilienceEvent {
    /// Stable machine-readable name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ResilienceEvent::RateLimited { .. } => "rate_limited",
            ResilienceEvent::AttemptFailed { .. } => "attempt_failed",
            ResilienceEvent::RetryScheduled { .. } => "retry_scheduled",
            ResilienceEvent::RetriesExhausted { .. } => "retries_exhausted",
            ResilienceEvent::BreakerTransition { .. } => "breaker_transition",
            ResilienceEvent::BreakerRejected { .. } => "breaker_rejected",
            ResilienceEvent::TimeoutFired { .. } => "timeout_fired",
            ResilienceEvent::Cancelled { .. } => "cancelled",
            ResilienceEvent::DisposalFailed { .. } => "disposal_failed",
        }
    }

    /// Whether the event reports a failure rather than routine progress.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        match self {
            ResilienceEvent::AttemptFailed { .. }
            | ResilienceEvent::RetriesExhausted { .. }
            | ResilienceEvent::BreakerRejected { .. }
            | ResilienceEvent::TimeoutFired { .. }
            | ResilienceEvent::DisposalFailed { .. } => true,
            ResilienceEvent::BreakerTransition { to, .. } => *to == CircuitState::Open,
            ResilienceEvent::RateLimited { .. }
            | ResilienceEvent::RetryScheduled { .. }
            | ResilienceEvent::Cancelled { .. } => false,
        }
    }
}

impl fmt::Display for ResilienceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResilienceEvent::RateLimited { wait } => write!(f, "rate limited, waiting {wait:?}"),
            ResilienceEvent::AttemptFailed {
                attempt,
                kind,
                error,
            } => write!(f, "attempt {attempt} failed ({kind}): {error}"),
            ResilienceEvent::RetryScheduled { attempt, delay } => {
                write!(f, "retrying after attempt {attempt} in {delay:?}")
            }
            ResilienceEvent::RetriesExhausted { attempts } => {
                write!(f, "retries exhausted after {attempts} attempts")
            }
            ResilienceEvent::BreakerTransition { from, to } => {
                write!(f, "circuit breaker {from} -> {to}")
            }
            ResilienceEvent::BreakerRejected { retry_after } => match retry_after {
                Some(after) => write!(f, "circuit breaker rejected call, probe in {after:?}"),
                None => write!(f, "circuit breaker rejected call"),
            },
            ResilienceEvent::TimeoutFired { deadline } => {
                write!(f, "deadline of {deadline:?} exceeded")
            }
            ResilienceEvent::Cancelled { stage } => write!(f, "cancelled during {stage}"),
            ResilienceEvent::DisposalFailed { label, error } => {
                write!(f, "failed to dispose {label}: {error}")
            }
        }
    }
}

/// Receives resilience events.
pub trait ResilienceListener: Send + Sync {
    fn on_event(&self, event: &ResilienceEvent);
}

/// Shared handle to a listener, as stored by every primitive.
pub type SharedListener = Arc<dyn ResilienceListener>;

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl ResilienceListener for NoopListener {
    fn on_event(&self, _event: &ResilienceEvent) {}
}

/// Forwards every event to a list of listeners.
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Vec<SharedListener>,
}

impl ListenerSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, listener: SharedListener) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn push(&mut self, listener: SharedListener) {
        self.listeners.push(listener);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ResilienceListener for ListenerSet {
    fn on_event(&self, event: &ResilienceEvent) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }
}

/// Default listener used when none is configured.
pub fn default_listener() -> SharedListener {
    Arc::new(TracingListener::new())
}

// =============================================================================
// Tracing listener
// =============================================================================

/// Log level used by the tracing listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Trace level - most verbose.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warn level.
    Warn,
    /// Error level - only errors.
    Error,
    /// Disabled - no logging.
    Off,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Off => write!(f, "OFF"),
        }
    }
}

/// Levels at which the tracing listener emits events.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for routine events (waits, scheduled retries, recoveries).
    pub event_level: LogLevel,
    /// Level for failure events (failed attempts, rejections, timeouts).
    pub failure_level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            event_level: LogLevel::Debug,
            failure_level: LogLevel::Warn,
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the level for routine events.
    #[must_use]
    pub fn with_event_level(mut self, level: LogLevel) -> Self {
        self.event_level = level;
        self
    }

    /// Set the level for failure events.
    #[must_use]
    pub fn with_failure_level(mut self, level: LogLevel) -> Self {
        self.failure_level = level;
        self
    }

    /// Everything at info or above, useful when debugging a flaky dependency.
    #[must_use]
    pub fn verbose() -> Self {
        Self {
            event_level: LogLevel::Info,
            failure_level: LogLevel::Warn,
        }
    }

    /// Only failures, at warn.
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            event_level: LogLevel::Off,
            failure_level: LogLevel::Warn,
        }
    }
}

/// Emits events through the `tracing` facade.
#[derive(Debug, Clone, Default)]
pub struct TracingListener {
    config: LoggingConfig,
}

impl TracingListener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: LoggingConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }

    fn level_for(&self, event: &ResilienceEvent) -> LogLevel {
        if event.is_failure() {
            self.config.failure_level
        } else {
            self.config.event_level
        }
    }
}

impl ResilienceListener for TracingListener {
    fn on_event(&self, event: &ResilienceEvent) {
        let name = event.name();
        match self.level_for(event) {
            LogLevel::Trace => trace!(target: EVENT_TARGET, event = name, "{}", event),
            LogLevel::Debug => debug!(target: EVENT_TARGET, event = name, "{}", event),
            LogLevel::Info => info!(target: EVENT_TARGET, event = name, "{}", event),
            LogLevel::Warn => warn!(target: EVENT_TARGET, event = name, "{}", event),
            LogLevel::Error => error!(target: EVENT_TARGET, event = name, "{}", event),
            LogLevel::Off => {}
        }
    }
}

// =============================================================================
// In-memory recorder
// =============================================================================

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Mutex<Vec<ResilienceEvent>>,
}

impl EventRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event seen so far.
    #[must_use]
    pub fn events(&self) -> Vec<ResilienceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded events with the given name.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl ResilienceListener for EventRecorder {
    fn on_event(&self, event: &ResilienceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
