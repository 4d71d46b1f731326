// SPDX-License-Identifier: MIT OR Apache-2.0

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use resilient_invoke::config::ResilienceConfig;
use resilient_invoke::error::{InvokeError, RemoteError};
use resilient_invoke::invoker::{InvokerConfig, ResilientInvoker};
use resilient_invoke::runtime::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, EventRecorder, ExponentialBackoff,
    MetricsCollector, RateLimiter, RateLimiterConfig, ResilienceEvent, ResourceScope,
    RetryConfig, ScopedTimeout,
};
use resilient_invoke::testkit::{DisposalProbe, ScriptedOperation};
use tokio::time::{sleep, Instant};
use tokio_test::{assert_err, assert_ok};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn transient(message: &str) -> Result<u32, RemoteError> {
    Err(RemoteError::transient(message))
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_invocations_are_spaced() {
    init_tracing();
    let interval = Duration::from_millis(100);
    let op: ScriptedOperation<(), RemoteError> = ScriptedOperation::new(Ok(()));
    let invoker = ResilientInvoker::new(InvokerConfig::new().with_min_interval(interval));

    let (a, b, c, d) = tokio::join!(
        invoker.invoke("a", || op.call()),
        invoker.invoke("b", || op.call()),
        invoker.invoke("c", || op.call()),
        invoker.invoke("d", || op.call()),
    );
    for invocation in [a, b, c, d] {
        assert!(invocation.is_success());
    }

    let mut starts = op.call_instants();
    starts.sort();
    assert_eq!(starts.len(), 4);
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= interval);
    }
}

#[tokio::test(start_paused = true)]
async fn test_rate_limiter_standalone_waits_remaining_interval() {
    let limiter = RateLimiter::new(RateLimiterConfig::new(Duration::from_millis(100)));

    limiter.acquire().await;
    sleep(Duration::from_millis(30)).await;
    let waited = limiter.acquire().await;

    assert_eq!(waited, Duration::from_millis(70));
}

// =============================================================================
// Retry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_schedule_doubles_and_returns_last_error() {
    let op = ScriptedOperation::new(transient("unexpected extra call"))
        .then(transient("failure 1"))
        .then(transient("failure 2"))
        .then(transient("failure 3"))
        .then(transient("failure 4"));
    let retry = RetryConfig::builder()
        .max_retries(3)
        .backoff(ExponentialBackoff::new(Duration::from_secs(1)))
        .build();

    let result = retry
        .execute(|| {
            let call = op.call();
            async move { call.await.map_err(InvokeError::Operation) }
        })
        .await;

    let error = assert_err!(result);
    assert_eq!(error.operation_error().unwrap().message, "failure 4");
    assert_eq!(op.calls(), 4);
    assert_eq!(
        op.call_gaps(),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_at_threshold_and_rejects_sixth_call() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::new().with_failure_threshold(5));
    let op: ScriptedOperation<u32, RemoteError> = ScriptedOperation::new(transient("down"));

    for _ in 0..5 {
        let result = breaker
            .call(|| async { op.call().await.map_err(InvokeError::Operation) })
            .await;
        assert!(result.unwrap_err().operation_error().is_some());
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let sixth = breaker
        .call(|| async { op.call().await.map_err(InvokeError::Operation) })
        .await;

    assert!(sixth.unwrap_err().is_breaker_open());
    assert_eq!(op.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_half_open_probe_success_closes() {
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_recovery_timeout(Duration::from_secs(60)),
    );
    for _ in 0..2 {
        let _ = breaker
            .call(|| async { Err::<(), _>(InvokeError::Operation(RemoteError::transient("x"))) })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    sleep(Duration::from_secs(61)).await;
    let probe = breaker
        .call(|| async { Ok::<_, InvokeError<RemoteError>>("recovered") })
        .await;

    assert_eq!(assert_ok!(probe), "recovered");
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_half_open_probe_failure_reopens() {
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_secs(60)),
    );
    let fail = || async { Err::<(), _>(InvokeError::Operation(RemoteError::transient("x"))) };

    let _ = breaker.call(fail).await;
    let opened_at = breaker.last_failure_time().unwrap();

    sleep(Duration::from_secs(61)).await;
    let _ = breaker.call(fail).await;

    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(breaker.last_failure_time().unwrap() > opened_at);
    // The recovery timer restarted from the failed probe.
    sleep(Duration::from_secs(30)).await;
    assert!(!breaker.can_execute());
}

// =============================================================================
// Timeout
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeout_fires_and_completes_just_under() {
    let timeout = ScopedTimeout::new(Duration::from_secs(2));

    let late = timeout
        .run_operation(async {
            sleep(Duration::from_secs(3)).await;
            Ok::<_, RemoteError>("late")
        })
        .await;
    match late {
        Err(InvokeError::DeadlineExceeded { deadline }) => {
            assert_eq!(deadline, Duration::from_secs(2));
        }
        other => panic!("expected deadline, got {other:?}"),
    }

    let started = Instant::now();
    let in_time = timeout
        .run_operation(async {
            sleep(Duration::from_millis(1999)).await;
            Ok::<_, RemoteError>("in time")
        })
        .await;
    assert_eq!(assert_ok!(in_time), "in time");
    assert_eq!(started.elapsed(), Duration::from_millis(1999));
}

// =============================================================================
// Resource scope
// =============================================================================

fn fetch_with_three_handles(probe: &DisposalProbe) -> Result<u32, RemoteError> {
    let mut scope = ResourceScope::new();
    scope
        .adopt("client", probe.handle("client"))
        .adopt("stream", probe.failing_handle("stream"))
        .adopt("log", probe.handle("log"));

    Err(RemoteError::permanent("request failed"))
}

#[test]
fn test_scope_disposes_each_handle_once_and_body_error_wins() {
    let probe = DisposalProbe::new();

    let err = fetch_with_three_handles(&probe).unwrap_err();

    assert_eq!(err.message, "request failed");
    assert_eq!(probe.order(), vec!["log", "stream", "client"]);
    for label in ["client", "stream", "log"] {
        assert_eq!(probe.count_for(label), 1);
    }
    assert_eq!(probe.disposed_count(), 3);
}

#[test]
fn test_scope_disposal_failure_does_not_mask_success() {
    let recorder = Arc::new(EventRecorder::new());
    let probe = DisposalProbe::new();

    let value = {
        let mut scope = ResourceScope::new().with_listener(recorder.clone());
        scope.adopt("flaky", probe.failing_handle("flaky"));
        42
    };

    assert_eq!(value, 42);
    assert_eq!(probe.count_for("flaky"), 1);
    assert_eq!(recorder.count("disposal_failed"), 1);
}

// =============================================================================
// Composition
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_breaker_counts_exhausted_retry_sequences() {
    init_tracing();
    let recorder = Arc::new(EventRecorder::new());
    let op: ScriptedOperation<u32, RemoteError> = ScriptedOperation::new(transient("down"));
    let invoker = ResilientInvoker::builder(
        InvokerConfig::new()
            .with_min_interval(Duration::ZERO)
            .with_max_retries(2)
            .with_base_delay(Duration::from_millis(100))
            .with_failure_threshold(3),
    )
    .listener(recorder.clone())
    .build();

    for run in 1..=3 {
        let invocation = invoker.invoke("generate", || op.call()).await;
        assert_eq!(invocation.attempts, 3);
        assert!(invocation.error().unwrap().operation_error().is_some());
        let expected = if run < 3 {
            CircuitState::Closed
        } else {
            CircuitState::Open
        };
        assert_eq!(invoker.circuit_breaker().state(), expected);
    }
    assert_eq!(op.calls(), 9);

    let rejected = invoker.invoke("generate", || op.call()).await;
    assert_eq!(rejected.attempts, 0);
    assert!(rejected.error().unwrap().is_breaker_open());
    assert_eq!(op.calls(), 9);

    assert_eq!(recorder.count("retries_exhausted"), 3);
    assert_eq!(recorder.count("breaker_rejected"), 1);
    assert!(recorder.events().contains(&ResilienceEvent::BreakerTransition {
        from: CircuitState::Closed,
        to: CircuitState::Open,
    }));
}

#[tokio::test(start_paused = true)]
async fn test_invoker_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "rate_limit:\n  min_interval_ms: 0\nretry:\n  max_retries: 1\n  base_delay_ms: 50\ntimeout:\n  deadline_ms: 200\n"
    )
    .unwrap();
    let config = ResilienceConfig::load_from_path(file.path())
        .unwrap()
        .validated();

    let metrics = Arc::new(MetricsCollector::with_defaults());
    let invoker = ResilientInvoker::builder(InvokerConfig::from(&config))
        .metrics(metrics.clone())
        .build();

    let op: ScriptedOperation<&str, RemoteError> = ScriptedOperation::new(Ok("answer"))
        .then_after(Duration::from_secs(1), Ok("too slow"));
    let invocation = invoker.invoke("generate", || op.call()).await;

    assert_eq!(invocation.attempts, 2);
    assert_eq!(invocation.elapsed, Duration::from_millis(250));
    assert_eq!(invocation.into_result().unwrap(), "answer");

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.timeouts, 1);
    assert_eq!(snapshot.successful_invocations, 1);
    assert!(metrics
        .to_prometheus_text()
        .contains("resilient_invoke_timeouts_total 1"));
}
