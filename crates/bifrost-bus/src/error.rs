//! Bus error types.

use crate::config::ConfigError;
use bifrost_types::CorrelationId;
use thiserror::Error;

/// Errors returned by bus operations.
///
/// Delivery problems never surface here: handler panics are isolated and
/// request failures arrive as error responses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// A request with this correlation id is already in flight.
    #[error("Correlation id already pending: {0}")]
    DuplicateCorrelationId(CorrelationId),

    /// `handle` was called on a message handler that is already subscribed.
    #[error("Handler already attached on channel: {channel}")]
    AlreadyHandling { channel: String },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
