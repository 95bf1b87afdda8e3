//! Fabric and bridge errors.

use bifrost_bus::BusError;
use bifrost_types::ConnectionState;
use thiserror::Error;

/// Errors raised by a transport adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport not open")]
    NotOpen,

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Connection-level errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FabricError {
    #[error("Invalid connection transition: {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Frame decode failed on channel {channel}: {reason}")]
    Decode { channel: String, reason: String },
}

/// Errors returned to callers of the galactic bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The fabric is not connected and queueing is disabled.
    #[error("Fabric not connected, cannot reach channel: {channel}")]
    NotConnected { channel: String },

    #[error("Outbound queue full ({limit} frames), dropping frame for channel: {channel}")]
    QueueFull { channel: String, limit: usize },

    #[error("Payload encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Fabric(#[from] FabricError),
}
