// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resilience primitives and their observability hooks.
//!
//! Each primitive is usable on its own; [`crate::invoker::ResilientInvoker`]
//! composes them in the order rate limiter, circuit breaker, retry, timeout.

mod circuit_breaker;
mod events;
mod metrics;
mod rate_limiter;
mod retry;
mod scope;
mod span;
mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use events::{
    default_listener, EventRecorder, ListenerSet, LogLevel, LoggingConfig, NoopListener,
    ResilienceEvent, ResilienceListener, SharedListener, TracingListener,
};
pub use metrics::{MetricsCollector, MetricsConfig, MetricsConfigBuilder, MetricsSnapshot};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{
    BackoffStrategy, CustomRetryPolicy, DefaultRetryPolicy, ExponentialBackoff, FixedBackoff,
    LinearBackoff, NoBackoff, NoRetryPolicy, RetryConfig, RetryConfigBuilder, RetryPolicy,
    TransientOnlyPolicy,
};
pub use scope::{DisposalFailure, DisposalReport, Dispose, ResourceScope};
pub use span::InvocationSpan;
pub use timeout::{ScopedTimeout, DEFAULT_DEADLINE};
