//! # Node Configuration
//!
//! Everything the demo node needs, with `BIFROST_*` environment overrides.

use bifrost_bus::config::duration_serde::parse_duration;
use bifrost_bus::BusConfig;
use bifrost_fabric::BridgeConfig;
use std::env;
use thiserror::Error;
use tracing::warn;

/// Complete node configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub bus: BusConfig,
    pub bridge: BridgeConfig,
    /// `EnvFilter` directive, e.g. `info` or `bifrost_fabric=debug`.
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    pub json_logs: bool,
    /// Channel served by the loopback servbot.
    pub joke_channel: String,
    pub cache_name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            bridge: BridgeConfig::default(),
            log_level: "info".to_string(),
            json_logs: false,
            joke_channel: "servbot".to_string(),
            cache_name: "jokes".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Bus(#[from] bifrost_bus::ConfigError),
    #[error(transparent)]
    Bridge(#[from] bifrost_fabric::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl NodeConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(level) = lookup("BIFROST_LOG_LEVEL").or_else(|| lookup("RUST_LOG")) {
            config.log_level = level;
        }
        if let Some(json) = lookup("BIFROST_JSON_LOGS") {
            config.json_logs = json.eq_ignore_ascii_case("true") || json == "1";
        }
        if let Some(name) = lookup("BIFROST_NODE_NAME") {
            config.bus.name = name;
        }
        if let Some(timeout) = lookup("BIFROST_REQUEST_TIMEOUT") {
            match parse_duration(&timeout) {
                Ok(d) => config.bus.request_timeout = d,
                Err(e) => warn!(value = %timeout, "BIFROST_REQUEST_TIMEOUT ignored: {}", e),
            }
        }
        if let Some(queue) = lookup("BIFROST_QUEUE_WHILE_DISCONNECTED") {
            config.bridge.queue_while_disconnected = queue.eq_ignore_ascii_case("true") || queue == "1";
        }
        if let Some(limit) = lookup("BIFROST_MAX_QUEUED_FRAMES") {
            match limit.parse() {
                Ok(n) => config.bridge.max_queued_frames = n,
                Err(_) => warn!(value = %limit, "BIFROST_MAX_QUEUED_FRAMES must be a number"),
            }
        }
        if let Some(channel) = lookup("BIFROST_JOKE_CHANNEL") {
            config.joke_channel = channel;
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus.validate()?;
        self.bridge.validate()?;
        if self.joke_channel.trim().is_empty() {
            return Err(ConfigError::Invalid("joke_channel cannot be empty".into()));
        }
        Ok(())
    }
}
