//! # Fabric Wire Types
//!
//! Connection state and the frames that cross the fabric connection.
//!
//! ```text
//! {"command":"subscribe","channel":"servbot"}
//! {"command":"message","frame":{"channel":"servbot","kind":"request",
//!                               "correlation_id":"…","version":1,"payload":{…}}}
//! {"command":"unsubscribe","channel":"servbot"}
//! ```

use crate::correlation::CorrelationId;
use crate::envelope::MessageKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one fabric connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// ```text
    /// Disconnected → Connecting → Connected → Disconnecting → Disconnected
    /// Connecting → Disconnected            (aborted attempt)
    /// any → Failed,  Failed → Connecting   (explicit reconnect)
    /// ```
    #[must_use]
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
                | (Failed, Connecting)
                | (_, Failed)
        )
    }

    #[must_use]
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An envelope in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FabricFrame {
    pub channel: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Everything that travels over the fabric, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum FabricCommand {
    /// Start forwarding a remote channel to this client.
    Subscribe { channel: String },
    /// Stop forwarding a remote channel.
    Unsubscribe { channel: String },
    /// One envelope.
    Message { frame: FabricFrame },
}

impl FabricCommand {
    /// Channel this command concerns.
    #[must_use]
    pub fn channel(&self) -> &str {
        match self {
            FabricCommand::Subscribe { channel } | FabricCommand::Unsubscribe { channel } => {
                channel
            }
            FabricCommand::Message { frame } => &frame.channel,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
