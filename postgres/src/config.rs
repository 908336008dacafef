//! Connection settings for the `PostgreSQL` participant.
//!
//! | Variable                     | Meaning                         | Default  |
//! |------------------------------|---------------------------------|----------|
//! | `DATABASE_URL`               | connection string (required)    |          |
//! | `DATABASE_MAX_CONNECTIONS`   | pool size                       | `10`     |
//! | `DATABASE_CONNECT_TIMEOUT`   | pool acquire timeout in seconds | `5`      |

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while configuring or connecting the participant.
#[derive(Error, Debug)]
pub enum PostgresError {
    /// A required variable is not set.
    #[error("Missing environment variable {0}")]
    MissingVar(&'static str),

    /// A variable was set to a value that does not parse.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Environment variable name
        var: &'static str,
        /// Offending value
        value: String,
    },

    /// The pool could not be created.
    #[error("Failed to connect: {0}")]
    Connect(#[from] sqlx::Error),
}

/// Pool settings for [`PostgresParticipant`](crate::PostgresParticipant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Connection string
    pub url: String,
    /// Maximum pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long to wait for a pooled connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

impl PostgresConfig {
    /// Settings for `url` with default pool limits.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            connect_timeout: default_connect_timeout(),
        }
    }

    /// Set the pool size.
    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set the acquire timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Load from process environment variables.
    ///
    /// # Errors
    ///
    /// - [`PostgresError::MissingVar`] when `DATABASE_URL` is unset
    /// - [`PostgresError::InvalidValue`] when a numeric variable does not parse
    pub fn from_env() -> Result<Self, PostgresError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load from an arbitrary variable lookup (used by `from_env`).
    ///
    /// # Errors
    ///
    /// Same as [`PostgresConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PostgresError> {
        let url = lookup("DATABASE_URL").ok_or(PostgresError::MissingVar("DATABASE_URL"))?;
        let mut config = Self::new(url);

        if let Some(raw) = lookup("DATABASE_MAX_CONNECTIONS") {
            config.max_connections =
                raw.trim().parse().map_err(|_| PostgresError::InvalidValue {
                    var: "DATABASE_MAX_CONNECTIONS",
                    value: raw.clone(),
                })?;
        }

        if let Some(raw) = lookup("DATABASE_CONNECT_TIMEOUT") {
            let secs: u64 = raw.trim().parse().map_err(|_| PostgresError::InvalidValue {
                var: "DATABASE_CONNECT_TIMEOUT",
                value: raw.clone(),
            })?;
            config.connect_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}
