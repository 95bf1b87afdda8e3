//! Bus configuration with validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest request timeout the bus accepts.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Event bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Name used in log lines
    pub name: String,
    /// How long a request waits for its response
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Period of the background expiry sweep
    #[serde(with = "duration_serde")]
    pub expiry_sweep_interval: Duration,
    /// Buffered monitor events per receiver
    pub monitor_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: "bifrost".to_string(),
            request_timeout: Duration::from_secs(10),
            expiry_sweep_interval: Duration::from_millis(250),
            monitor_capacity: 1024,
        }
    }
}

impl BusConfig {
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "request_timeout cannot be 0".into(),
            ));
        }
        if self.request_timeout > MAX_REQUEST_TIMEOUT {
            return Err(ConfigError::InvalidTimeout(format!(
                "request_timeout cannot exceed {}s",
                MAX_REQUEST_TIMEOUT.as_secs()
            )));
        }
        if self.expiry_sweep_interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "expiry_sweep_interval cannot be 0".into(),
            ));
        }
        if self.expiry_sweep_interval > self.request_timeout {
            return Err(ConfigError::InvalidTimeout(
                "expiry_sweep_interval cannot exceed request_timeout".into(),
            ));
        }
        if self.monitor_capacity == 0 {
            return Err(ConfigError::InvalidCapacity(
                "monitor_capacity cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Invalid buffer capacity
    #[error("invalid capacity: {0}")]
    InvalidCapacity(String),
}

/// Durations as `"250ms"`, `"10s"`, `"2m"` or plain seconds.
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse the textual duration forms accepted in config files.
    pub fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .ok()
                .and_then(|m| m.checked_mul(60))
                .map(Duration::from_secs)
                .ok_or("invalid minutes")
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}
