// SPDX-License-Identifier: MIT OR Apache-2.0

//! Example: calling a flaky dependency through every resilience layer
//!
//! Shows each primitive on its own, then the composed invoker:
//! - rate limiter spacing out call starts
//! - retry with exponential backoff
//! - circuit breaker rejecting calls once the dependency is down
//! - per-attempt timeout
//! - scoped cleanup of acquired handles
//! - metrics in Prometheus text format

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilient_invoke::error::{InvokeError, RemoteError};
use resilient_invoke::invoker::{InvokerConfig, ResilientInvoker};
use resilient_invoke::runtime::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, ExponentialBackoff, MetricsCollector,
    RateLimiter, RateLimiterConfig, ResourceScope, ScopedTimeout, TracingListener,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // ==========================================================================
    // 1. Rate limiter
    // ==========================================================================
    println!("=== Rate Limiter ===");

    let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_millis(50)));
    for i in 1..=3 {
        let waited = limiter.acquire().await;
        println!("  Call {i} waited {waited:?}");
    }

    // ==========================================================================
    // 2. Backoff schedule
    // ==========================================================================
    println!("\n=== Backoff Schedule ===");

    let backoff = ExponentialBackoff::new(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_multiplier(2.0);
    for attempt in 0..5 {
        println!("  Retry {}: {:?}", attempt + 1, backoff.delay(attempt));
    }

    // ==========================================================================
    // 3. Circuit breaker
    // ==========================================================================
    println!("\n=== Circuit Breaker ===");

    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_recovery_timeout(Duration::from_millis(200)),
    );
    for i in 1..=3 {
        let result = breaker
            .call(|| async {
                Err::<(), _>(InvokeError::Operation(RemoteError::transient("refused")))
            })
            .await;
        println!("  Call {i}: {:?} (state: {})", result, breaker.state());
    }
    println!("  Retry in: {:?}", breaker.time_until_retry());
    println!("  Failure rate: {:.2}%", breaker.failure_rate() * 100.0);

    // ==========================================================================
    // 4. Timeout
    // ==========================================================================
    println!("\n=== Scoped Timeout ===");

    let timeout = ScopedTimeout::new(Duration::from_millis(100));
    let slow = timeout
        .run_operation(async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, RemoteError>("slow answer")
        })
        .await;
    println!("  Slow call: {slow:?}");

    // ==========================================================================
    // 5. Resource scope
    // ==========================================================================
    println!("\n=== Resource Scope ===");

    let mut scope = ResourceScope::new();
    scope
        .defer("connection", || {
            println!("  closing connection");
            Ok::<_, RemoteError>(())
        })
        .defer("stream", || {
            println!("  closing stream");
            Err(RemoteError::permanent("stream already closed"))
        });
    let report = scope.close();
    println!(
        "  Disposed {} handle(s), {} failure(s)",
        report.disposed,
        report.failed.len()
    );

    // ==========================================================================
    // 6. Composed invoker
    // ==========================================================================
    println!("\n=== Resilient Invoker ===");

    let metrics = Arc::new(MetricsCollector::with_defaults());
    let invoker = ResilientInvoker::builder(
        InvokerConfig::new()
            .with_min_interval(Duration::from_millis(10))
            .with_max_retries(3)
            .with_base_delay(Duration::from_millis(50))
            .with_timeout(Duration::from_millis(500))
            .with_failure_threshold(3),
    )
    .listener(Arc::new(TracingListener::new()))
    .metrics(metrics.clone())
    .build();

    // Fails twice, then answers.
    let calls = AtomicU32::new(0);
    let invocation = invoker
        .invoke("generate", || {
            let n = calls.fetch_add(1, Ordering::Relaxed) + 1;
            async move {
                if n < 3 {
                    Err(RemoteError::transient(format!("overloaded (call {n})")))
                } else {
                    Ok(format!("answer after {n} calls"))
                }
            }
        })
        .await;
    println!(
        "  {}: {:?} in {} attempt(s), {:?}",
        invocation.operation, invocation.outcome, invocation.attempts, invocation.elapsed
    );

    println!("\n=== Metrics ===");
    print!("{}", metrics.to_prometheus_text());

    Ok(())
}
