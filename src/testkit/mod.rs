// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic stand-ins for remote operations and disposable handles.
//!
//! Pair these with `#[tokio::test(start_paused = true)]` so recorded call
//! instants are exact.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::runtime::Dispose;

#[derive(Clone)]
struct Step<T, E> {
    delay: Duration,
    outcome: Result<T, E>,
}

struct Script<T, E> {
    steps: VecDeque<Step<T, E>>,
    fallback: Step<T, E>,
    calls: Vec<Instant>,
}

/// An operation that replays scripted outcomes and records when it was called.
///
/// Once the script runs out every further call gets the fallback outcome.
pub struct ScriptedOperation<T, E> {
    script: Arc<Mutex<Script<T, E>>>,
}

impl<T, E> Clone for ScriptedOperation<T, E> {
    fn clone(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
        }
    }
}

impl<T, E> ScriptedOperation<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create an operation that returns `fallback` on every call.
    pub fn new(fallback: Result<T, E>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                steps: VecDeque::new(),
                fallback: Step {
                    delay: Duration::ZERO,
                    outcome: fallback,
                },
                calls: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Script<T, E>> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an outcome for the next unscripted call.
    #[must_use]
    pub fn then(self, outcome: Result<T, E>) -> Self {
        self.then_after(Duration::ZERO, outcome)
    }

    /// Queue an outcome that is produced after `delay`.
    #[must_use]
    pub fn then_after(self, delay: Duration, outcome: Result<T, E>) -> Self {
        self.lock().steps.push_back(Step { delay, outcome });
        self
    }

    /// Queue `count` copies of `outcome`.
    #[must_use]
    pub fn repeat(self, count: usize, outcome: Result<T, E>) -> Self {
        {
            let mut script = self.lock();
            for _ in 0..count {
                script.steps.push_back(Step {
                    delay: Duration::ZERO,
                    outcome: outcome.clone(),
                });
            }
        }
        self
    }

    /// Start one call.
    pub fn call(&self) -> impl Future<Output = Result<T, E>> + Send + 'static {
        let script = Arc::clone(&self.script);
        async move {
            let step = {
                let mut script = script.lock().unwrap_or_else(PoisonError::into_inner);
                script.calls.push(Instant::now());
                match script.steps.pop_front() {
                    Some(step) => step,
                    None => script.fallback.clone(),
                }
            };
            if !step.delay.is_zero() {
                tokio::time::sleep(step.delay).await;
            }
            step.outcome
        }
    }

    /// How many times the operation has been started.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.lock().calls.len()
    }

    /// When each call started.
    #[must_use]
    pub fn call_instants(&self) -> Vec<Instant> {
        self.lock().calls.clone()
    }

    /// Gaps between successive call starts.
    #[must_use]
    pub fn call_gaps(&self) -> Vec<Duration> {
        self.lock()
            .calls
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

/// Hands out disposable handles and records every disposal, in order.
#[derive(Debug, Clone, Default)]
pub struct DisposalProbe {
    log: Arc<Mutex<Vec<String>>>,
}

impl DisposalProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A handle that disposes cleanly.
    #[must_use]
    pub fn handle(&self, label: &str) -> ProbeHandle {
        ProbeHandle {
            label: label.to_string(),
            log: Arc::clone(&self.log),
            fail: false,
        }
    }

    /// A handle whose disposal is recorded and then reports an error.
    #[must_use]
    pub fn failing_handle(&self, label: &str) -> ProbeHandle {
        ProbeHandle {
            fail: true,
            ..self.handle(label)
        }
    }

    #[must_use]
    pub fn disposed_count(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn count_for(&self, label: &str) -> usize {
        self.lock().iter().filter(|l| *l == label).count()
    }

    /// Labels in the order they were disposed.
    #[must_use]
    pub fn order(&self) -> Vec<String> {
        self.lock().clone()
    }
}

/// A handle issued by [`DisposalProbe`].
#[derive(Debug)]
pub struct ProbeHandle {
    label: String,
    log: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl Dispose for ProbeHandle {
    type Error = std::io::Error;

    fn dispose(self) -> Result<(), Self::Error> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.label.clone());
        if self.fail {
            return Err(std::io::Error::other(format!(
                "failed to release {}",
                self.label
            )));
        }
        Ok(())
    }
}
