// SPDX-License-Identifier: MIT OR Apache-2.0

//! One `tracing` span per logical invocation.
//!
//! The span is opened before the rate limiter is consulted and closed after
//! the last attempt, so everything the primitives log in between is nested
//! under it. Exporting spans (for example to OpenTelemetry) is left to the
//! subscriber the application installs.
//!
//! # Fields
//!
//! | Field | Description |
//! |-------|-------------|
//! | `operation` | Caller-supplied operation name |
//! | `attempts` | Attempts made, including the first |
//! | `outcome` | `success` or the error kind label |
//! | `duration_ms` | Wall time of the whole invocation |
//! | `error.message` | Sanitized error text, on failure |
//!
//! # Example
//!
//! ```rust
//! use resilient_invoke::runtime::InvocationSpan;
//! use std::time::Duration;
//!
//! let span = InvocationSpan::new("generate");
//! span.record_success(1, Duration::from_millis(42));
//! ```

use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{field, info_span, Span};

use crate::error::{sanitize_error_message, InvokeError};

/// A span covering one logical invocation.
#[derive(Debug)]
pub struct InvocationSpan {
    span: Span,
    start: Instant,
    operation: String,
}

impl InvocationSpan {
    /// Create a new span for the named operation.
    pub fn new(operation: &str) -> Self {
        let span = info_span!(
            "invoke",
            operation = %operation,
            attempts = field::Empty,
            outcome = field::Empty,
            duration_ms = field::Empty,
            error.message = field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            operation: operation.to_string(),
        }
    }

    /// Get the underlying `tracing::Span`.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Get elapsed time since span creation.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record a successful invocation.
    pub fn record_success(&self, attempts: u32, duration: Duration) {
        self.span.record("attempts", attempts);
        self.span.record("outcome", "success");
        self.span.record("duration_ms", duration_ms(duration));
    }

    /// Record a failed invocation.
    pub fn record_error<E: fmt::Display>(
        &self,
        attempts: u32,
        error: &InvokeError<E>,
        duration: Duration,
    ) {
        self.span.record("attempts", attempts);
        self.span.record("outcome", error.kind_label());
        self.span.record(
            "error.message",
            sanitize_error_message(&error.to_string()).as_str(),
        );
        self.span.record("duration_ms", duration_ms(duration));
    }

    /// Enter the span context for synchronous work.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
