// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded, concurrency-safe reliability for fallible remote calls.
//!
//! The crate provides five cooperating primitives and a client that composes
//! them:
//!
//! - [`runtime::RateLimiter`] spaces out call starts
//! - [`runtime::CircuitBreaker`] stops calling a dependency that keeps failing
//! - [`runtime::RetryConfig`] retries failures with exponential backoff
//! - [`runtime::ScopedTimeout`] bounds each attempt
//! - [`runtime::ResourceScope`] releases acquired handles exactly once
//! - [`invoker::ResilientInvoker`] applies all of the above to one operation

pub mod config;
pub mod error;
pub mod invoker;
pub mod runtime;
pub mod testkit;

pub use config::ResilienceConfig;
pub use error::{Classify, FailureKind, InvokeError, RemoteError};
pub use invoker::{Invocation, InvokerConfig, ResilientInvoker};
