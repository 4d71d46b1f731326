// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration management for resilient invocations
//!
//! This module loads [`ResilienceConfig`] from a YAML file and the environment
//! and turns it into the runtime configuration of each primitive.
//!
//! # Environment Variables
//!
//! The following environment variables are supported:
//!
//! - `RESILIENT_INVOKE_CONFIG` - Path to the config file (default: `~/.resilient-invoke/config.yaml`)
//! - `RESILIENT_INVOKE_TIMEOUT_MS` - Override the per-attempt deadline
//! - `RESILIENT_INVOKE_MAX_RETRIES` - Override the retry count
//! - `RESILIENT_INVOKE_MIN_INTERVAL_MS` - Override the rate limiter spacing
//!
//! # Example
//!
//! ```no_run
//! use resilient_invoke::config::ResilienceConfig;
//! use resilient_invoke::invoker::{InvokerConfig, ResilientInvoker};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load with environment variable overrides
//! let config = ResilienceConfig::load_with_env()?;
//! let invoker = ResilientInvoker::new(InvokerConfig::from(&config));
//! # Ok(())
//! # }
//! ```

mod resilience;

pub use resilience::{
    CircuitBreakerSection, RateLimitSection, ResilienceConfig, RetrySection, TimeoutSection,
    ENV_CONFIG, ENV_MAX_RETRIES, ENV_MIN_INTERVAL_MS, ENV_TIMEOUT_MS,
};
