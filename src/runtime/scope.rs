// SPDX-License-Identifier: MIT OR Apache-2.0

//! Guaranteed cleanup for the handles acquired during one unit of work.
//!
//! Handles are registered on a [`ResourceScope`] as they are acquired. When
//! the scope is closed or dropped (including on an early `?` return or a
//! panic unwinding through it) every registered disposer runs exactly once,
//! newest first. Disposal failures are reported as events and never replace
//! the error of the work itself.
//!
//! # Example
//!
//! ```
//! use resilient_invoke::runtime::ResourceScope;
//!
//! let mut scope = ResourceScope::new();
//! scope.defer("connection", || Ok::<_, std::io::Error>(()));
//! scope.defer("session", || Ok::<_, std::io::Error>(()));
//!
//! let report = scope.close();
//! assert_eq!(report.disposed, 2);
//! assert!(report.is_clean());
//! ```

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use super::events::{default_listener, ResilienceEvent, SharedListener};
use crate::error::sanitize_error_message;

/// A handle that knows how to release itself.
pub trait Dispose: Send {
    type Error: fmt::Display;

    /// Release the handle.
    fn dispose(self) -> Result<(), Self::Error>;
}

impl Dispose for std::fs::File {
    type Error = std::io::Error;

    /// Flush to disk; the descriptor is closed when the file is dropped.
    fn dispose(self) -> Result<(), Self::Error> {
        self.sync_all()
    }
}

impl<T: Send + 'static> Dispose for tokio::task::JoinHandle<T> {
    type Error = std::convert::Infallible;

    fn dispose(self) -> Result<(), Self::Error> {
        self.abort();
        Ok(())
    }
}

type DisposeFn = Box<dyn FnOnce() -> Result<(), String> + Send>;

struct Disposer {
    label: String,
    run: DisposeFn,
}

/// A disposer that did not complete cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisposalFailure {
    pub label: String,
    pub error: String,
}

/// What happened when a scope was torn down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisposalReport {
    /// Number of disposers that ran, successful or not.
    pub disposed: usize,
    /// Disposers that returned an error or panicked.
    pub failed: Vec<DisposalFailure>,
}

impl DisposalReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// An explicit, ordered list of disposers released in reverse registration order.
pub struct ResourceScope {
    disposers: Vec<Disposer>,
    listener: SharedListener,
}

impl ResourceScope {
    /// Create an empty scope.
    #[must_use]
    pub fn new() -> Self {
        Self {
            disposers: Vec::new(),
            listener: default_listener(),
        }
    }

    /// Route events to `listener` instead of the default tracing listener.
    #[must_use]
    pub fn with_listener(mut self, listener: SharedListener) -> Self {
        self.listener = listener;
        self
    }

    /// Register a cleanup callback.
    pub fn defer<F, E>(&mut self, label: impl Into<String>, dispose: F) -> &mut Self
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        self.disposers.push(Disposer {
            label: label.into(),
            run: Box::new(move || dispose().map_err(|e| e.to_string())),
        });
        self
    }

    /// Take ownership of a handle and dispose it when the scope ends.
    pub fn adopt<D>(&mut self, label: impl Into<String>, handle: D) -> &mut Self
    where
        D: Dispose + 'static,
    {
        self.defer(label, move || handle.dispose())
    }

    /// Number of disposers still pending.
    #[must_use]
    pub fn len(&self) -> usize {
        self.disposers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.disposers.is_empty()
    }

    /// Dispose everything now and report the outcome.
    pub fn close(mut self) -> DisposalReport {
        self.dispose_all()
    }

    fn dispose_all(&mut self) -> DisposalReport {
        let mut report = DisposalReport::default();

        while let Some(Disposer { label, run }) = self.disposers.pop() {
            report.disposed += 1;
            let error = match panic::catch_unwind(AssertUnwindSafe(run)) {
                Ok(Ok(())) => {
                    tracing::trace!(resource = %label, "disposed");
                    continue;
                }
                Ok(Err(error)) => error,
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };

            let error = sanitize_error_message(&error);
            self.listener.on_event(&ResilienceEvent::DisposalFailed {
                label: label.clone(),
                error: error.clone(),
            });
            report.failed.push(DisposalFailure { label, error });
        }

        report
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl Default for ResourceScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        if !self.disposers.is_empty() {
            let _ = self.dispose_all();
        }
    }
}

impl fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self.disposers.iter().map(|d| d.label.as_str()).collect();
        f.debug_struct("ResourceScope")
            .field("pending", &labels)
            .finish_non_exhaustive()
    }
}
