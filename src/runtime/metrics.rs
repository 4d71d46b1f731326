// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prometheus-compatible metrics for resilient invocations.
//!
//! [`MetricsCollector`] is a [`ResilienceListener`]: register it with the
//! invoker and it aggregates every event, plus one sample per finished
//! invocation.
//!
//! # Features
//!
//! - Invocation counters per operation and outcome
//! - Invocation duration histograms
//! - Retry, timeout and cancellation counters
//! - Circuit breaker state gauge and rejection counter
//! - Rate limiter wait totals
//!
//! # Example
//!
//! ```rust
//! use resilient_invoke::runtime::{MetricsCollector, MetricsConfig};
//!
//! let config = MetricsConfig::builder()
//!     .namespace("inference")
//!     .operation_label(true)
//!     .build();
//!
//! let metrics = MetricsCollector::new(config);
//!
//! // Record an invocation
//! metrics.record_invocation("generate", "success", 1, std::time::Duration::from_millis(42));
//!
//! // Get Prometheus text format
//! let output = metrics.to_prometheus_text();
//! assert!(output.contains("inference_invocations_total"));
//! ```

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use super::circuit_breaker::CircuitState;
use super::events::{ResilienceEvent, ResilienceListener};

/// Configuration for the metrics collector.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric namespace prefix (e.g., "inference" -> "inference_invocations_total")
    pub namespace: String,
    /// Include the operation name as a label
    pub operation_label: bool,
    /// Histogram buckets for invocation time (in seconds)
    pub histogram_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: "resilient_invoke".to_string(),
            operation_label: true,
            histogram_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ],
        }
    }
}

impl MetricsConfig {
    /// Create a new builder for `MetricsConfig`.
    pub fn builder() -> MetricsConfigBuilder {
        MetricsConfigBuilder::default()
    }
}

/// Builder for `MetricsConfig`.
#[derive(Debug, Default)]
pub struct MetricsConfigBuilder {
    namespace: Option<String>,
    operation_label: Option<bool>,
    histogram_buckets: Option<Vec<f64>>,
}

impl MetricsConfigBuilder {
    /// Set the metric namespace prefix.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Enable or disable operation labels.
    pub fn operation_label(mut self, enabled: bool) -> Self {
        self.operation_label = Some(enabled);
        self
    }

    /// Set histogram buckets for invocation time (in seconds).
    pub fn histogram_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.histogram_buckets = Some(buckets);
        self
    }

    /// Build the `MetricsConfig`.
    pub fn build(self) -> MetricsConfig {
        let default = MetricsConfig::default();
        MetricsConfig {
            namespace: self.namespace.unwrap_or(default.namespace),
            operation_label: self.operation_label.unwrap_or(default.operation_label),
            histogram_buckets: self.histogram_buckets.unwrap_or(default.histogram_buckets),
        }
    }
}

/// Labels for an invocation sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Labels {
    operation: Option<String>,
    outcome: String,
}

/// A single histogram with cumulative bucket counters.
#[derive(Debug)]
struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_nanos: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_nanos: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: Duration) {
        let secs = value.as_secs_f64();
        for (bucket, count) in self.buckets.iter().zip(&self.counts) {
            if secs <= *bucket {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
        // Values above every bucket only show up in +Inf, which is the total count.
        self.sum_nanos.fetch_add(
            u64::try_from(value.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn sum_secs(&self) -> f64 {
        self.sum_nanos.load(Ordering::Relaxed) as f64 / 1_000_000_000.0
    }

    fn total_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Thread-safe metrics collector fed by resilience events.
#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    /// Counter: invocations_total{operation, outcome}
    invocations_total: RwLock<HashMap<Labels, AtomicU64>>,
    /// Histogram: invocation_duration_seconds{operation}
    invocation_duration: RwLock<HashMap<Option<String>, Histogram>>,
    /// Counter: attempts_total (every attempt across all invocations)
    attempts_total: AtomicU64,
    /// Counter: attempt_failures_total
    attempt_failures: AtomicU64,
    /// Counter: retries_total
    retries: AtomicU64,
    /// Counter: retries_exhausted_total
    retries_exhausted: AtomicU64,
    /// Counter: rate_limited_total
    rate_limited: AtomicU64,
    /// Counter: rate_limit_wait_seconds_total (stored as nanoseconds)
    rate_limit_wait_nanos: AtomicU64,
    /// Gauge: circuit_breaker_state (0=closed, 1=half-open, 2=open)
    circuit_breaker_state: AtomicU64,
    /// Counter: circuit_breaker_transitions_total
    circuit_breaker_transitions: AtomicU64,
    /// Counter: circuit_breaker_rejections_total
    circuit_breaker_rejections: AtomicU64,
    /// Counter: timeouts_total
    timeouts: AtomicU64,
    /// Counter: cancellations_total
    cancellations: AtomicU64,
    /// Counter: disposal_failures_total
    disposal_failures: AtomicU64,
    /// Start time for uptime metric
    start_time: Instant,
}

impl MetricsCollector {
    /// Create a new metrics collector with the given configuration.
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            invocations_total: RwLock::new(HashMap::new()),
            invocation_duration: RwLock::new(HashMap::new()),
            attempts_total: AtomicU64::new(0),
            attempt_failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            retries_exhausted: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            rate_limit_wait_nanos: AtomicU64::new(0),
            circuit_breaker_state: AtomicU64::new(CircuitState::Closed.as_gauge()),
            circuit_breaker_transitions: AtomicU64::new(0),
            circuit_breaker_rejections: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            disposal_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Create a new metrics collector with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(MetricsConfig::default())
    }

    /// Record a finished invocation.
    ///
    /// `outcome` is `"success"` or an error kind label such as `"breaker_open"`.
    pub fn record_invocation(
        &self,
        operation: &str,
        outcome: &str,
        attempts: u32,
        duration: Duration,
    ) {
        let operation = self.config.operation_label.then(|| operation.to_string());
        let labels = Labels {
            operation: operation.clone(),
            outcome: outcome.to_string(),
        };

        {
            let counters = read(&self.invocations_total);
            if let Some(counter) = counters.get(&labels) {
                counter.fetch_add(1, Ordering::Relaxed);
            } else {
                drop(counters);
                write(&self.invocations_total)
                    .entry(labels)
                    .or_insert_with(|| AtomicU64::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        {
            let histograms = read(&self.invocation_duration);
            if let Some(hist) = histograms.get(&operation) {
                hist.observe(duration);
            } else {
                drop(histograms);
                write(&self.invocation_duration)
                    .entry(operation)
                    .or_insert_with(|| Histogram::new(self.config.histogram_buckets.clone()))
                    .observe(duration);
            }
        }

        self.attempts_total
            .fetch_add(u64::from(attempts), Ordering::Relaxed);
    }

    /// Get the total number of invocations.
    pub fn total_invocations(&self) -> u64 {
        read(&self.invocations_total)
            .values()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Get the number of successful invocations.
    pub fn successful_invocations(&self) -> u64 {
        self.invocations_with_outcome(|outcome| outcome == "success")
    }

    /// Get the number of failed invocations.
    pub fn failed_invocations(&self) -> u64 {
        self.invocations_with_outcome(|outcome| outcome != "success")
    }

    fn invocations_with_outcome(&self, filter: impl Fn(&str) -> bool) -> u64 {
        read(&self.invocations_total)
            .iter()
            .filter(|(labels, _)| filter(&labels.outcome))
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Current circuit breaker state as last reported by a transition event.
    pub fn circuit_breaker_state(&self) -> CircuitState {
        match self.circuit_breaker_state.load(Ordering::Relaxed) {
            1 => CircuitState::HalfOpen,
            2 => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }

    /// Get collector uptime.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_invocations: self.total_invocations(),
            successful_invocations: self.successful_invocations(),
            failed_invocations: self.failed_invocations(),
            attempts: self.attempts_total.load(Ordering::Relaxed),
            attempt_failures: self.attempt_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            rate_limit_wait: Duration::from_nanos(
                self.rate_limit_wait_nanos.load(Ordering::Relaxed),
            ),
            circuit_breaker_state: self.circuit_breaker_state(),
            circuit_breaker_transitions: self.circuit_breaker_transitions.load(Ordering::Relaxed),
            circuit_breaker_rejections: self.circuit_breaker_rejections.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            disposal_failures: self.disposal_failures.load(Ordering::Relaxed),
            uptime: self.uptime(),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus_text(&self) -> String {
        let mut output = String::new();
        let ns = &self.config.namespace;

        // Invocation counter
        let _ = writeln!(output, "# HELP {ns}_invocations_total Total number of invocations");
        let _ = writeln!(output, "# TYPE {ns}_invocations_total counter");
        {
            let counters = read(&self.invocations_total);
            for (labels, count) in counters.iter() {
                let mut label_parts = vec![format!("outcome=\"{}\"", labels.outcome)];
                if let Some(ref operation) = labels.operation {
                    label_parts.insert(0, format!("operation=\"{operation}\""));
                }
                let label_str = label_parts.join(",");
                let _ = writeln!(
                    output,
                    "{ns}_invocations_total{{{label_str}}} {}",
                    count.load(Ordering::Relaxed)
                );
            }
        }
        output.push('\n');

        // Invocation duration histogram
        let _ = writeln!(
            output,
            "# HELP {ns}_invocation_duration_seconds Invocation duration in seconds"
        );
        let _ = writeln!(output, "# TYPE {ns}_invocation_duration_seconds histogram");
        {
            let histograms = read(&self.invocation_duration);
            for (operation, hist) in histograms.iter() {
                let base_labels = match operation {
                    Some(op) => format!("operation=\"{op}\","),
                    None => String::new(),
                };

                for (bucket, count) in hist.buckets.iter().zip(&hist.counts) {
                    let _ = writeln!(
                        output,
                        "{ns}_invocation_duration_seconds_bucket{{{base_labels}le=\"{bucket}\"}} {}",
                        count.load(Ordering::Relaxed)
                    );
                }

                let total = hist.total_count();
                let _ = writeln!(
                    output,
                    "{ns}_invocation_duration_seconds_bucket{{{base_labels}le=\"+Inf\"}} {total}"
                );

                let plain_labels = base_labels.trim_end_matches(',');
                if plain_labels.is_empty() {
                    let _ = writeln!(
                        output,
                        "{ns}_invocation_duration_seconds_sum {}",
                        hist.sum_secs()
                    );
                    let _ = writeln!(output, "{ns}_invocation_duration_seconds_count {total}");
                } else {
                    let _ = writeln!(
                        output,
                        "{ns}_invocation_duration_seconds_sum{{{plain_labels}}} {}",
                        hist.sum_secs()
                    );
                    let _ = writeln!(
                        output,
                        "{ns}_invocation_duration_seconds_count{{{plain_labels}}} {total}"
                    );
                }
            }
        }
        output.push('\n');

        let counters: [(&str, &str, &AtomicU64); 9] = [
            ("attempts_total", "Attempts made, including retries", &self.attempts_total),
            ("attempt_failures_total", "Attempts that failed", &self.attempt_failures),
            ("retries_total", "Retries scheduled after a failed attempt", &self.retries),
            (
                "retries_exhausted_total",
                "Invocations that ran out of retries",
                &self.retries_exhausted,
            ),
            ("rate_limited_total", "Calls delayed by the rate limiter", &self.rate_limited),
            (
                "circuit_breaker_transitions_total",
                "Circuit breaker state changes",
                &self.circuit_breaker_transitions,
            ),
            (
                "circuit_breaker_rejections_total",
                "Calls rejected by the circuit breaker",
                &self.circuit_breaker_rejections,
            ),
            ("timeouts_total", "Attempts cut off by their deadline", &self.timeouts),
            ("cancellations_total", "Invocations cancelled by the caller", &self.cancellations),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {ns}_{name} {help}");
            let _ = writeln!(output, "# TYPE {ns}_{name} counter");
            let _ = writeln!(output, "{ns}_{name} {}\n", value.load(Ordering::Relaxed));
        }

        let _ = writeln!(
            output,
            "# HELP {ns}_disposal_failures_total Resource disposals that failed"
        );
        let _ = writeln!(output, "# TYPE {ns}_disposal_failures_total counter");
        let _ = writeln!(
            output,
            "{ns}_disposal_failures_total {}\n",
            self.disposal_failures.load(Ordering::Relaxed)
        );

        let _ = writeln!(
            output,
            "# HELP {ns}_rate_limit_wait_seconds_total Time spent waiting for the rate limiter"
        );
        let _ = writeln!(output, "# TYPE {ns}_rate_limit_wait_seconds_total counter");
        let _ = writeln!(
            output,
            "{ns}_rate_limit_wait_seconds_total {}\n",
            self.rate_limit_wait_nanos.load(Ordering::Relaxed) as f64 / 1_000_000_000.0
        );

        // Circuit breaker gauge
        let _ = writeln!(
            output,
            "# HELP {ns}_circuit_breaker_state Circuit breaker state (0=closed, 1=half-open, 2=open)"
        );
        let _ = writeln!(output, "# TYPE {ns}_circuit_breaker_state gauge");
        let _ = writeln!(
            output,
            "{ns}_circuit_breaker_state {}\n",
            self.circuit_breaker_state.load(Ordering::Relaxed)
        );

        // Uptime
        let _ = writeln!(output, "# HELP {ns}_uptime_seconds Collector uptime in seconds");
        let _ = writeln!(output, "# TYPE {ns}_uptime_seconds gauge");
        let _ = writeln!(output, "{ns}_uptime_seconds {}", self.uptime().as_secs_f64());

        output
    }
}

impl ResilienceListener for MetricsCollector {
    fn on_event(&self, event: &ResilienceEvent) {
        match event {
            ResilienceEvent::RateLimited { wait } => {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
                self.rate_limit_wait_nanos.fetch_add(
                    u64::try_from(wait.as_nanos()).unwrap_or(u64::MAX),
                    Ordering::Relaxed,
                );
            }
            ResilienceEvent::AttemptFailed { .. } => {
                self.attempt_failures.fetch_add(1, Ordering::Relaxed);
            }
            ResilienceEvent::RetryScheduled { .. } => {
                self.retries.fetch_add(1, Ordering::Relaxed);
            }
            ResilienceEvent::RetriesExhausted { .. } => {
                self.retries_exhausted.fetch_add(1, Ordering::Relaxed);
            }
            ResilienceEvent::BreakerTransition { to, .. } => {
                self.circuit_breaker_state
                    .store(to.as_gauge(), Ordering::Relaxed);
                self.circuit_breaker_transitions
                    .fetch_add(1, Ordering::Relaxed);
            }
            ResilienceEvent::BreakerRejected { .. } => {
                self.circuit_breaker_rejections
                    .fetch_add(1, Ordering::Relaxed);
            }
            ResilienceEvent::TimeoutFired { .. } => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            ResilienceEvent::Cancelled { .. } => {
                self.cancellations.fetch_add(1, Ordering::Relaxed);
            }
            ResilienceEvent::DisposalFailed { .. } => {
                self.disposal_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Snapshot of current metrics for programmatic access.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total invocations
    pub total_invocations: u64,
    /// Successful invocations
    pub successful_invocations: u64,
    /// Failed invocations (any error kind)
    pub failed_invocations: u64,
    /// Attempts across all invocations
    pub attempts: u64,
    /// Failed attempts
    pub attempt_failures: u64,
    /// Retries scheduled
    pub retries: u64,
    /// Retry sequences that ran out of attempts
    pub retries_exhausted: u64,
    /// Calls delayed by the rate limiter
    pub rate_limited: u64,
    /// Total time spent waiting for the rate limiter
    pub rate_limit_wait: Duration,
    /// Circuit breaker state
    pub circuit_breaker_state: CircuitState,
    /// Circuit breaker transition count
    pub circuit_breaker_transitions: u64,
    /// Circuit breaker rejection count
    pub circuit_breaker_rejections: u64,
    /// Deadlines that fired
    pub timeouts: u64,
    /// Caller cancellations
    pub cancellations: u64,
    /// Failed disposals
    pub disposal_failures: u64,
    /// Collector uptime
    pub uptime: Duration,
}
