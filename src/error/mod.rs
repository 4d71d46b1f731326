// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy shared by every resilience primitive.
//!
//! Every layer reports failures as an [`InvokeError`], so callers can tell
//! "the operation failed" apart from "we gave up waiting" and "we never tried".

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Maximum length of an error message that is forwarded to logs and events.
pub const MAX_ERROR_MESSAGE_LEN: usize = 200;

/// Failure reported by the resilience layers around an operation with error type `E`.
#[derive(Debug, Error)]
pub enum InvokeError<E> {
    /// The wrapped operation itself failed.
    #[error("operation failed: {0}")]
    Operation(#[source] E),

    /// The scoped timeout fired before the operation completed.
    #[error("deadline of {deadline:?} exceeded")]
    DeadlineExceeded { deadline: Duration },

    /// The circuit breaker rejected the call without attempting it.
    #[error("circuit breaker is open{}", retry_hint(.retry_after))]
    BreakerOpen { retry_after: Option<Duration> },

    /// The caller's cancellation token fired.
    #[error("invocation cancelled")]
    Cancelled,
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(after) => format!(", will allow a probe after {after:?}"),
        None => String::new(),
    }
}

impl<E> InvokeError<E> {
    /// Returns the operation's own error, if this is an operation failure.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            InvokeError::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Consumes the error and returns the operation's own error, if any.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            InvokeError::Operation(e) => Some(e),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, InvokeError::DeadlineExceeded { .. })
    }

    #[must_use]
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, InvokeError::BreakerOpen { .. })
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InvokeError::Cancelled)
    }

    /// Short stable label used for logs and metrics.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            InvokeError::Operation(_) => "operation_failed",
            InvokeError::DeadlineExceeded { .. } => "deadline_exceeded",
            InvokeError::BreakerOpen { .. } => "breaker_open",
            InvokeError::Cancelled => "cancelled",
        }
    }
}

pub type Result<T, E> = std::result::Result<T, InvokeError<E>>;

// =============================================================================
// Failure classification
// =============================================================================

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureKind {
    /// Temporary condition (throttling, network blip, overloaded upstream).
    #[default]
    Transient,
    /// Retrying cannot help (malformed input, authorization failure).
    Permanent,
}

/// Lets an operation error declare whether it is transient or permanent.
///
/// The default treats every failure as transient.
pub trait Classify {
    fn failure_kind(&self) -> FailureKind {
        FailureKind::Transient
    }
}

impl<E: Classify> Classify for InvokeError<E> {
    fn failure_kind(&self) -> FailureKind {
        match self {
            InvokeError::Operation(e) => e.failure_kind(),
            InvokeError::DeadlineExceeded { .. } => FailureKind::Transient,
            InvokeError::BreakerOpen { .. } | InvokeError::Cancelled => FailureKind::Permanent,
        }
    }
}

/// General-purpose remote failure for callers without their own error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} remote failure: {message}")]
pub struct RemoteError {
    pub kind: FailureKind,
    pub message: String,
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }
}

impl Classify for RemoteError {
    fn failure_kind(&self) -> FailureKind {
        self.kind
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

// =============================================================================
// Configuration errors
// =============================================================================

/// Errors raised while loading a [`ResilienceConfig`](crate::config::ResilienceConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("could not determine home directory")]
    NoHomeDir,
}

/// Strip local paths from an error message and cap its length before it is logged.
#[must_use]
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = match dirs::home_dir() {
        Some(home) => {
            let home = home.to_string_lossy();
            if home.is_empty() || home == "/" {
                message.to_string()
            } else {
                message.replace(home.as_ref(), "~")
            }
        }
        None => message.to_string(),
    };

    if sanitized.chars().count() > MAX_ERROR_MESSAGE_LEN {
        let truncated: String = sanitized.chars().take(MAX_ERROR_MESSAGE_LEN).collect();
        format!("{truncated}...")
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        let op: InvokeError<RemoteError> = InvokeError::Operation(RemoteError::transient("x"));
        assert_eq!(op.kind_label(), "operation_failed");
        assert_eq!(
            InvokeError::<RemoteError>::DeadlineExceeded {
                deadline: Duration::from_secs(1)
            }
            .kind_label(),
            "deadline_exceeded"
        );
        assert_eq!(
            InvokeError::<RemoteError>::BreakerOpen { retry_after: None }.kind_label(),
            "breaker_open"
        );
        assert_eq!(InvokeError::<RemoteError>::Cancelled.kind_label(), "cancelled");
    }

    #[test]
    fn test_operation_error_accessors() {
        let err: InvokeError<RemoteError> = InvokeError::Operation(RemoteError::permanent("bad"));
        assert_eq!(err.operation_error().map(|e| e.message.as_str()), Some("bad"));
        assert!(!err.is_breaker_open());

        let other: InvokeError<RemoteError> = InvokeError::Cancelled;
        assert!(other.operation_error().is_none());
        assert!(other.into_operation_error().is_none());
    }

    #[test]
    fn test_display_messages() {
        let open: InvokeError<RemoteError> = InvokeError::BreakerOpen {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert!(open.to_string().starts_with("circuit breaker is open"));
        assert!(open.to_string().contains("5s"));

        let closed_hint: InvokeError<RemoteError> = InvokeError::BreakerOpen { retry_after: None };
        assert_eq!(closed_hint.to_string(), "circuit breaker is open");

        let remote = RemoteError::transient("throttled");
        assert_eq!(remote.to_string(), "transient remote failure: throttled");
    }

    #[test]
    fn test_classification() {
        let transient: InvokeError<RemoteError> =
            InvokeError::Operation(RemoteError::transient("throttled"));
        let permanent: InvokeError<RemoteError> =
            InvokeError::Operation(RemoteError::permanent("validation"));
        let deadline: InvokeError<RemoteError> = InvokeError::DeadlineExceeded {
            deadline: Duration::from_millis(10),
        };

        assert_eq!(transient.failure_kind(), FailureKind::Transient);
        assert_eq!(permanent.failure_kind(), FailureKind::Permanent);
        assert_eq!(deadline.failure_kind(), FailureKind::Transient);
        assert_eq!(
            InvokeError::<RemoteError>::Cancelled.failure_kind(),
            FailureKind::Permanent
        );
    }

    #[test]
    fn test_sanitize_truncates() {
        let long = "e".repeat(500);
        let sanitized = sanitize_error_message(&long);
        assert_eq!(sanitized.len(), MAX_ERROR_MESSAGE_LEN + 3);
        assert!(sanitized.ends_with("..."));

        assert_eq!(sanitize_error_message("short"), "short");
    }

    #[test]
    fn test_sanitize_strips_home() {
        if let Some(home) = dirs::home_dir() {
            let home = home.to_string_lossy().to_string();
            if home.len() > 1 {
                let msg = format!("cannot open {home}/.aws/credentials");
                let sanitized = sanitize_error_message(&msg);
                assert_eq!(sanitized, "cannot open ~/.aws/credentials");
            }
        }
    }
}
