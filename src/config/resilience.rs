// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resilience configuration file parser
//!
//! The file is YAML with one section per primitive. Every field is optional;
//! missing fields take the built-in defaults. Durations are milliseconds.
//!
//! ```yaml
//! rate_limit:
//!   min_interval_ms: 100
//! retry:
//!   max_retries: 3
//!   base_delay_ms: 1000
//! circuit_breaker:
//!   failure_threshold: 5
//!   recovery_timeout_ms: 60000
//! timeout:
//!   deadline_ms: 30000
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::runtime::{CircuitBreakerConfig, ExponentialBackoff, RateLimiterConfig};

/// Path override for the config file.
pub const ENV_CONFIG: &str = "RESILIENT_INVOKE_CONFIG";
/// Override for `timeout.deadline_ms`.
pub const ENV_TIMEOUT_MS: &str = "RESILIENT_INVOKE_TIMEOUT_MS";
/// Override for `retry.max_retries`.
pub const ENV_MAX_RETRIES: &str = "RESILIENT_INVOKE_MAX_RETRIES";
/// Override for `rate_limit.min_interval_ms`.
pub const ENV_MIN_INTERVAL_MS: &str = "RESILIENT_INVOKE_MIN_INTERVAL_MS";

const MAX_TIMEOUT_MS: u64 = 300_000;
const MAX_RETRIES_LIMIT: u32 = 10;

/// Represents the entire resilience configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    pub rate_limit: RateLimitSection,
    pub retry: RetrySection,
    pub circuit_breaker: CircuitBreakerSection,
    pub timeout: TimeoutSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitSection {
    /// Minimum spacing between call starts
    pub min_interval_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            min_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySection {
    /// Attempts after the first
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each following retry
    pub base_delay_ms: u64,
    /// Upper bound on a single delay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
    /// Budget for the whole retry sequence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_timeout_ms: Option<u64>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: None,
            jitter: false,
            total_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: usize,
    pub recovery_timeout_ms: u64,
    pub success_threshold: usize,
    pub half_open_max_requests: usize,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            success_threshold: 1,
            half_open_max_requests: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutSection {
    /// Deadline for a single attempt
    pub deadline_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self { deadline_ms: 30_000 }
    }
}

impl ResilienceConfig {
    /// Load configuration from the default location (~/.resilient-invoke/config.yaml)
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The home directory cannot be determined
    /// - The config file cannot be read
    /// - The config file is malformed
    pub fn load_default() -> Result<Self, ConfigError> {
        let config_path = Self::default_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed YAML
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().display().to_string(),
            source,
        })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Serialize the configuration back to YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Get the default config file path (~/.resilient-invoke/config.yaml)
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(".resilient-invoke").join("config.yaml"))
    }

    /// Get the path to the config file, respecting `RESILIENT_INVOKE_CONFIG`
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined when the
    /// variable is not set
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        match std::env::var(ENV_CONFIG) {
            Ok(env_path) => Ok(PathBuf::from(env_path)),
            Err(_) => Self::default_path(),
        }
    }

    /// Load from [`config_path`](Self::config_path) if that file exists, apply
    /// environment overrides, then clamp out-of-range values.
    ///
    /// A missing file is not an error; the defaults are used instead.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed, or if an
    /// override variable does not hold a number.
    pub fn load_with_env() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            Self::load_from_path(&path)?
        } else {
            tracing::debug!(path = %path.display(), "no resilience config file, using defaults");
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config.validated())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnv` if a value is not a non-negative integer.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_override(&lookup, ENV_TIMEOUT_MS)? {
            self.timeout.deadline_ms = ms;
        }
        if let Some(retries) = parse_override(&lookup, ENV_MAX_RETRIES)? {
            self.retry.max_retries = retries;
        }
        if let Some(ms) = parse_override(&lookup, ENV_MIN_INTERVAL_MS)? {
            self.rate_limit.min_interval_ms = ms;
        }
        Ok(())
    }

    /// Replace out-of-range values with defaults.
    ///
    /// - a deadline of 0 or above 300 s becomes 30 s
    /// - a failure threshold of 0 becomes 5
    /// - more than 10 retries becomes 3
    /// - success threshold and half-open probe count are at least 1
    #[must_use]
    pub fn validated(mut self) -> Self {
        if self.timeout.deadline_ms == 0 || self.timeout.deadline_ms > MAX_TIMEOUT_MS {
            tracing::warn!(
                deadline_ms = self.timeout.deadline_ms,
                "timeout out of range, using default"
            );
            self.timeout.deadline_ms = TimeoutSection::default().deadline_ms;
        }
        if self.circuit_breaker.failure_threshold == 0 {
            tracing::warn!("failure threshold of 0, using default");
            self.circuit_breaker.failure_threshold =
                CircuitBreakerSection::default().failure_threshold;
        }
        if self.retry.max_retries > MAX_RETRIES_LIMIT {
            tracing::warn!(
                max_retries = self.retry.max_retries,
                "too many retries, using default"
            );
            self.retry.max_retries = RetrySection::default().max_retries;
        }
        self.circuit_breaker.success_threshold = self.circuit_breaker.success_threshold.max(1);
        self.circuit_breaker.half_open_max_requests =
            self.circuit_breaker.half_open_max_requests.max(1);
        self
    }

    /// Deadline for a single attempt.
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.timeout.deadline_ms)
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::new(Duration::from_millis(self.rate_limit.min_interval_ms))
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.circuit_breaker.failure_threshold)
            .with_recovery_timeout(Duration::from_millis(
                self.circuit_breaker.recovery_timeout_ms,
            ))
            .with_success_threshold(self.circuit_breaker.success_threshold)
            .with_half_open_max_requests(self.circuit_breaker.half_open_max_requests)
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        let backoff = ExponentialBackoff::new(Duration::from_millis(self.retry.base_delay_ms))
            .with_jitter(self.retry.jitter);
        match self.retry.max_delay_ms {
            Some(max) => backoff.with_max_delay(Duration::from_millis(max)),
            None => backoff,
        }
    }

    pub fn total_retry_timeout(&self) -> Option<Duration> {
        self.retry.total_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_override<F, N>(lookup: &F, name: &'static str) -> Result<Option<N>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    N: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
    }
}
