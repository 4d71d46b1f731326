// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deadlines for a single remote call.
//!
//! A [`ScopedTimeout`] races a future against a timer. When the timer wins the
//! future is dropped, which cancels it at its next suspension point. There is
//! no process-wide state, so timeouts nest and overlap freely across tasks.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{default_listener, ResilienceEvent, SharedListener};
use crate::error::InvokeError;

/// Default deadline applied to a single call.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Bounds how long one piece of work may take.
#[derive(Clone)]
pub struct ScopedTimeout {
    deadline: Duration,
    listener: SharedListener,
}

impl ScopedTimeout {
    /// Create a timeout with the given deadline.
    ///
    /// A zero deadline still polls the future once, so work that is already
    /// complete is not reported as timed out.
    #[must_use]
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
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
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    fn expired<E>(&self) -> InvokeError<E> {
        self.listener.on_event(&ResilienceEvent::TimeoutFired {
            deadline: self.deadline,
        });
        InvokeError::DeadlineExceeded {
            deadline: self.deadline,
        }
    }

    /// Run `fut`, dropping it if the deadline passes first.
    ///
    /// # Errors
    ///
    /// Returns `InvokeError::DeadlineExceeded` on expiry, otherwise whatever `fut` returns.
    pub async fn run<T, E, Fut>(&self, fut: Fut) -> Result<T, InvokeError<E>>
    where
        Fut: Future<Output = Result<T, InvokeError<E>>>,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(self.expired()),
        }
    }

    /// Run a plain operation future, wrapping its error as `InvokeError::Operation`.
    ///
    /// # Errors
    ///
    /// Returns `InvokeError::DeadlineExceeded` on expiry or `InvokeError::Operation`
    /// if the operation fails.
    pub async fn run_operation<T, E, Fut>(&self, fut: Fut) -> Result<T, InvokeError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(async { fut.await.map_err(InvokeError::Operation) })
            .await
    }

    /// Like [`run`](Self::run), but also gives up when `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns `InvokeError::Cancelled` if the token fires first.
    pub async fn run_with_cancel<T, E, Fut>(
        &self,
        token: &CancellationToken,
        fut: Fut,
    ) -> Result<T, InvokeError<E>>
    where
        Fut: Future<Output = Result<T, InvokeError<E>>>,
    {
        tokio::select! {
            biased;
            () = token.cancelled() => {
                self.listener.on_event(&ResilienceEvent::Cancelled { stage: "timeout" });
                Err(InvokeError::Cancelled)
            }
            result = self.run(fut) => result,
        }
    }

    /// Run `fut` as its own task and abort that task if the deadline passes.
    ///
    /// Unlike [`run`](Self::run) the work keeps making progress while the caller
    /// is not polling. The task is also aborted if the returned future is dropped.
    ///
    /// # Errors
    ///
    /// Returns `InvokeError::DeadlineExceeded` on expiry and `InvokeError::Cancelled`
    /// if the task was aborted from elsewhere.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from the spawned task on the caller.
    pub async fn spawn<T, E, Fut>(&self, fut: Fut) -> Result<T, InvokeError<E>>
    where
        Fut: Future<Output = Result<T, InvokeError<E>>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut task = AbortOnDrop(tokio::spawn(fut));
        match tokio::time::timeout(self.deadline, &mut task.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => match join_error.try_into_panic() {
                Ok(payload) => std::panic::resume_unwind(payload),
                Err(_) => Err(InvokeError::Cancelled),
            },
            Err(_) => {
                task.0.abort();
                Err(self.expired())
            }
        }
    }
}

impl Default for ScopedTimeout {
    fn default() -> Self {
        Self::new(DEFAULT_DEADLINE)
    }
}

impl std::fmt::Debug for ScopedTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedTimeout")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::runtime::events::EventRecorder;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::{sleep, Instant};
    use tokio_test::{assert_err, assert_ok};

    type Outcome = Result<&'static str, InvokeError<RemoteError>>;

    async fn slow(duration: Duration) -> Outcome {
        sleep(duration).await;
        Ok("done")
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_default_deadline() {
        assert_eq!(ScopedTimeout::default().deadline(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_deadline() {
        let recorder = Arc::new(EventRecorder::new());
        let timeout = ScopedTimeout::new(Duration::from_millis(100)).with_listener(recorder.clone());

        let started = Instant::now();
        let result = timeout.run(slow(Duration::from_secs(5))).await;

        let err = assert_err!(result);
        assert!(err.is_deadline_exceeded());
        assert_eq!(started.elapsed(), Duration::from_millis(100));
        assert_eq!(recorder.count("timeout_fired"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_just_under_deadline() {
        let recorder = Arc::new(EventRecorder::new());
        let timeout = ScopedTimeout::new(Duration::from_millis(100)).with_listener(recorder.clone());

        let value = assert_ok!(timeout.run(slow(Duration::from_millis(99))).await);
        assert_eq!(value, "done");
        assert!(recorder.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_future_is_dropped() {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(dropped.clone());
        let timeout = ScopedTimeout::new(Duration::from_millis(10));

        let result = timeout
            .run(async move {
                let _flag = flag;
                slow(Duration::from_secs(60)).await
            })
            .await;

        assert!(result.is_err());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_error_passes_through() {
        let timeout = ScopedTimeout::new(Duration::from_secs(1));
        let result: Outcome = timeout
            .run_operation(async { Err(RemoteError::permanent("denied")) })
            .await;

        let err = assert_err!(result);
        assert_eq!(err.operation_error().unwrap().message, "denied");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_deadline_polls_once() {
        let timeout = ScopedTimeout::new(Duration::ZERO);
        let ready: Outcome = timeout.run(async { Ok("ready") }).await;
        assert_eq!(ready.unwrap(), "ready");

        let pending = timeout.run(slow(Duration::from_millis(1))).await;
        assert!(pending.unwrap_err().is_deadline_exceeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_timeouts_are_independent() {
        let outer = ScopedTimeout::new(Duration::from_millis(500));
        let inner = ScopedTimeout::new(Duration::from_millis(50));

        let result = outer
            .run(async {
                let first = inner.run(slow(Duration::from_secs(1))).await;
                assert!(first.unwrap_err().is_deadline_exceeded());
                inner.run(slow(Duration::from_millis(10))).await
            })
            .await;

        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_timeouts_do_not_interfere() {
        let short = ScopedTimeout::new(Duration::from_millis(20));
        let long = ScopedTimeout::new(Duration::from_millis(200));

        let (a, b) = tokio::join!(
            short.run(slow(Duration::from_millis(100))),
            long.run(slow(Duration::from_millis(100))),
        );

        assert!(a.unwrap_err().is_deadline_exceeded());
        assert_eq!(b.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_cancel() {
        let timeout = ScopedTimeout::new(Duration::from_secs(30));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });

        let result = timeout
            .run_with_cancel(&token, slow(Duration::from_secs(10)))
            .await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_aborts_task_on_timeout() {
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();
        let timeout = ScopedTimeout::new(Duration::from_millis(55));

        let result: Outcome = timeout
            .spawn(async move {
                loop {
                    sleep(Duration::from_millis(10)).await;
                    if counter.fetch_add(1, Ordering::SeqCst) == u32::MAX {
                        break;
                    }
                }
                Ok("unreachable")
            })
            .await;
        assert!(result.unwrap_err().is_deadline_exceeded());

        let at_abort = ticks.load(Ordering::SeqCst);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), at_abort);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_returns_result() {
        let timeout = ScopedTimeout::new(Duration::from_secs(1));
        let result = timeout.spawn(slow(Duration::from_millis(10))).await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn test_spawn_propagates_panic() {
        let timeout = ScopedTimeout::new(Duration::from_secs(1));
        let _: Outcome = timeout
            .spawn(async {
                if Instant::now().elapsed() < Duration::from_secs(1) {
                    panic!("boom");
                }
                Ok("never")
            })
            .await;
    }
}
