//! Coordinator configuration.
//!
//! Built in code with the `with_*` setters, or loaded from environment
//! variables with sensible defaults:
//!
//! | Variable                        | Meaning                                  | Default      |
//! |---------------------------------|------------------------------------------|--------------|
//! | `TWOPHASE_PREPARE_TIMEOUT_MS`   | per-participant prepare timeout, 0 = off | `30000`      |
//! | `TWOPHASE_COMMIT_TIMEOUT_MS`    | per-participant commit timeout, 0 = off  | `30000`      |
//! | `TWOPHASE_ROLLBACK_TIMEOUT_MS`  | per-participant rollback timeout, 0 = off| `30000`      |
//! | `TWOPHASE_PREPARE_RETRIES`      | retries of a timed-out prepare           | `0`          |
//! | `TWOPHASE_PREPARE_MODE`         | `sequential` or `concurrent`             | `sequential` |

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration loading errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was set to a value that does not parse.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Environment variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
}

/// How prepare calls are issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareMode {
    /// One participant at a time, in registration order
    #[default]
    Sequential,
    /// All participants at once; results are all collected before deciding
    Concurrent,
}

impl fmt::Display for PrepareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => f.write_str("sequential"),
            Self::Concurrent => f.write_str("concurrent"),
        }
    }
}

impl FromStr for PrepareMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "concurrent" | "parallel" => Ok(Self::Concurrent),
            other => Err(other.to_string()),
        }
    }
}

/// Settings for a `DistributedUnitOfWork`.
///
/// # Example
///
/// ```
/// use twophase_runtime::config::{CoordinatorConfig, PrepareMode};
/// use twophase_runtime::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let config = CoordinatorConfig::default()
///     .with_prepare_timeout(Duration::from_secs(5))
///     .with_prepare_retry(RetryPolicy::new(2, Duration::from_millis(100)))
///     .with_prepare_mode(PrepareMode::Concurrent);
///
/// assert_eq!(config.prepare_timeout, Some(Duration::from_secs(5)));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Bound on each prepare call; `None` waits forever
    pub prepare_timeout: Option<Duration>,
    /// Bound on each commit call; `None` waits forever
    pub commit_timeout: Option<Duration>,
    /// Bound on each rollback call; `None` waits forever
    pub rollback_timeout: Option<Duration>,
    /// Retry policy for timed-out prepare calls
    pub prepare_retry: RetryPolicy,
    /// Sequential or concurrent prepare
    pub prepare_mode: PrepareMode,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Some(DEFAULT_CALL_TIMEOUT),
            commit_timeout: Some(DEFAULT_CALL_TIMEOUT),
            rollback_timeout: Some(DEFAULT_CALL_TIMEOUT),
            prepare_retry: RetryPolicy::none(),
            prepare_mode: PrepareMode::Sequential,
        }
    }
}

impl CoordinatorConfig {
    /// Set the prepare timeout.
    #[must_use]
    pub const fn with_prepare_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout = Some(timeout);
        self
    }

    /// Set the commit timeout.
    #[must_use]
    pub const fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = Some(timeout);
        self
    }

    /// Set the rollback timeout.
    #[must_use]
    pub const fn with_rollback_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_timeout = Some(timeout);
        self
    }

    /// Disable all call timeouts.
    #[must_use]
    pub const fn without_timeouts(mut self) -> Self {
        self.prepare_timeout = None;
        self.commit_timeout = None;
        self.rollback_timeout = None;
        self
    }

    /// Set the prepare retry policy.
    #[must_use]
    pub fn with_prepare_retry(mut self, policy: RetryPolicy) -> Self {
        self.prepare_retry = policy;
        self
    }

    /// Set the prepare mode.
    #[must_use]
    pub const fn with_prepare_mode(mut self, mode: PrepareMode) -> Self {
        self.prepare_mode = mode;
        self
    }

    /// Load from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when a variable is set but does not
    /// parse. Unset variables fall back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load from an arbitrary variable lookup (used by `from_env`).
    ///
    /// # Errors
    ///
    /// Same as [`CoordinatorConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let timeout = |var: &'static str, default: Option<Duration>| match lookup(var) {
            None => Ok(default),
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(0) => Ok(None),
                Ok(ms) => Ok(Some(Duration::from_millis(ms))),
                Err(_) => Err(ConfigError::InvalidValue { var, value: raw }),
            },
        };

        let prepare_timeout = timeout("TWOPHASE_PREPARE_TIMEOUT_MS", defaults.prepare_timeout)?;
        let commit_timeout = timeout("TWOPHASE_COMMIT_TIMEOUT_MS", defaults.commit_timeout)?;
        let rollback_timeout = timeout("TWOPHASE_ROLLBACK_TIMEOUT_MS", defaults.rollback_timeout)?;

        let mut prepare_retry = defaults.prepare_retry;
        if let Some(raw) = lookup("TWOPHASE_PREPARE_RETRIES") {
            prepare_retry.max_retries =
                raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    var: "TWOPHASE_PREPARE_RETRIES",
                    value: raw.clone(),
                })?;
        }

        let prepare_mode = match lookup("TWOPHASE_PREPARE_MODE") {
            None => defaults.prepare_mode,
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                var: "TWOPHASE_PREPARE_MODE",
                value: raw.clone(),
            })?,
        };

        Ok(Self {
            prepare_timeout,
            commit_timeout,
            rollback_timeout,
            prepare_retry,
            prepare_mode,
        })
    }
}
