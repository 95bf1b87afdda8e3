//! Galactic bridge configuration with validation.

use serde::{Deserialize, Serialize};

/// Bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Queue outbound frames while disconnected instead of failing fast
    pub queue_while_disconnected: bool,
    /// Upper bound on queued outbound frames
    pub max_queued_frames: usize,
    /// Consumer name owning the bridge's response listeners
    pub consumer: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            queue_while_disconnected: false,
            max_queued_frames: 256,
            consumer: "galactic-bridge".to_string(),
        }
    }
}

impl BridgeConfig {
    #[must_use]
    pub fn queueing(mut self) -> Self {
        self.queue_while_disconnected = true;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_while_disconnected && self.max_queued_frames == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_queued_frames cannot be 0 when queueing is enabled".into(),
            ));
        }
        if self.consumer.trim().is_empty() {
            return Err(ConfigError::Invalid("consumer cannot be empty".into()));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Invalid size or count limit
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
