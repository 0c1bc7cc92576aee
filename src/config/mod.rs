//! Pool configuration — sizing, retry policy and connection parameters.
//!
//! [`PoolConfig`] can be built in code with the `with_*` methods or
//! deserialized from JSON. Durations are expressed in milliseconds on the
//! wire.
//!
//! ```
//! use chainpool::config::PoolConfig;
//!
//! let config = PoolConfig::from_json(r#"{
//!     "min_size": 1,
//!     "max_size": 20,
//!     "max_queue": 10,
//!     "connection": { "host": "localhost", "database": "app", "user": "app" }
//! }"#).unwrap();
//!
//! assert_eq!(config.max_size, 20);
//! assert_eq!(config.connection.target(), "localhost/app");
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or validating a [`PoolConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pool config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("max_size must be at least 1")]
    ZeroMaxSize,

    #[error("min_size ({min}) exceeds max_size ({max})")]
    MinExceedsMax { min: usize, max: usize },
}

const DEFAULT_MIN_SIZE: usize = 1;
const DEFAULT_MAX_SIZE: usize = 20;
const DEFAULT_MAX_QUEUE: usize = 10;
const DEFAULT_CONNECT_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Where and as whom to connect.
///
/// Anything the core does not interpret goes in `extras` and is passed
/// through to the driver untouched.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectParams {
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub extras: BTreeMap<String, String>,
}

impl ConnectParams {
    pub fn new(host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            database: database.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Adds a driver-specific option.
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// `host/database`, used in logs and error messages.
    pub fn target(&self) -> String {
        format!("{}/{}", self.host, self.database)
    }
}

// Keeps the password out of logs.
impl fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("extras", &self.extras)
            .finish()
    }
}

/// Sizing and behavior of a [`Pool`](crate::pool::Pool).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened eagerly and kept warm.
    pub min_size: usize,
    /// Hard cap on live connections.
    pub max_size: usize,
    /// Waiters allowed to queue once every connection is busy.
    pub max_queue: usize,
    /// Extra establishment attempts after the first failure.
    pub connect_retries: u32,
    /// Delay before the first retry; doubled after each failure.
    #[serde(with = "millis", rename = "retry_backoff_ms")]
    pub retry_backoff: Duration,
    /// How often idle connections above `min_size` are closed.
    #[serde(with = "millis", rename = "cleanup_interval_ms")]
    pub cleanup_interval: Duration,
    pub connection: ConnectParams,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            max_queue: DEFAULT_MAX_QUEUE,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            connection: ConnectParams::default(),
        }
    }
}

impl PoolConfig {
    /// Creates a config with the given sizing and default retry policy.
    pub fn new(min_size: usize, max_size: usize, max_queue: usize, connection: ConnectParams) -> Self {
        Self {
            min_size,
            max_size,
            max_queue,
            connection,
            ..Self::default()
        }
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and the validation
    /// errors of [`validate`](Self::validate) otherwise.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Checks the sizing invariants.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::ZeroMaxSize`] if `max_size` is 0.
    /// - [`ConfigError::MinExceedsMax`] if `min_size > max_size`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::ZeroMaxSize);
        }
        if self.min_size > self.max_size {
            return Err(ConfigError::MinExceedsMax {
                min: self.min_size,
                max: self.max_size,
            });
        }
        Ok(())
    }

    /// Backoff to wait before retry number `attempt` (0-based).
    pub(crate) fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.min_size, 1);
        assert_eq!(config.max_size, 20);
        assert_eq!(config.max_queue, 10);
        assert_eq!(config.connect_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_json_partial() {
        let config = PoolConfig::from_json(
            r#"{"max_size": 4, "retry_backoff_ms": 5, "connection": {"host": "db", "password": "pw"}}"#,
        )
        .unwrap();
        assert_eq!(config.max_size, 4);
        assert_eq!(config.min_size, 1);
        assert_eq!(config.retry_backoff, Duration::from_millis(5));
        assert_eq!(config.connection.password.as_deref(), Some("pw"));
    }

    #[test]
    fn from_json_rejects_min_above_max() {
        let err = PoolConfig::from_json(r#"{"min_size": 5, "max_size": 2}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MinExceedsMax { min: 5, max: 2 }));
    }

    #[test]
    fn from_json_rejects_zero_max() {
        let err = PoolConfig::from_json(r#"{"min_size": 0, "max_size": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroMaxSize));
    }

    #[test]
    fn from_json_rejects_garbage() {
        assert!(matches!(
            PoolConfig::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn debug_redacts_password() {
        let params = ConnectParams::new("localhost", "app").password("hunter2");
        let debug = format!("{params:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn extras_pass_through() {
        let params = ConnectParams::new("h", "d").user("u").port(5433).extra("sslmode", "require");
        assert_eq!(params.extras.get("sslmode").map(String::as_str), Some("require"));
        assert_eq!(params.port, Some(5433));
        assert_eq!(params.target(), "h/d");
    }

    #[test]
    fn backoff_doubles() {
        let config = PoolConfig::default().with_retry_backoff(Duration::from_millis(10));
        assert_eq!(config.backoff_for(0), Duration::from_millis(10));
        assert_eq!(config.backoff_for(1), Duration::from_millis(20));
        assert_eq!(config.backoff_for(3), Duration::from_millis(80));
    }
}
