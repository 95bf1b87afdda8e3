//! # Envelope
//!
//! The unit transmitted on a channel.
//!
//! The payload is opaque to the bus: it is stored as `Arc<dyn Any>` and
//! recovered with a typed downcast by whoever knows the channel contract.
//! Cloning an envelope never clones the payload.

use crate::correlation::CorrelationId;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Shared, type-erased payload.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// What an envelope means to the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Asks a responder for something; carries a correlation id.
    Request,
    /// Successful answer to a request.
    Response,
    /// Failed answer to a request, payload is an [`ApiError`](crate::ApiError).
    Error,
    /// Plain broadcast with no request behind it.
    Data,
}

impl MessageKind {
    /// `Response` or `Error`.
    #[must_use]
    pub fn is_reply(self) -> bool {
        matches!(self, MessageKind::Response | MessageKind::Error)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Error => "error",
            MessageKind::Data => "data",
        };
        f.write_str(s)
    }
}

/// A message on its way to the subscribers of one channel.
#[derive(Clone)]
pub struct Envelope {
    /// Unique id of this envelope (not the correlation id).
    pub id: Uuid,
    /// Target channel name.
    pub channel: String,
    /// Request, response, error or data.
    pub kind: MessageKind,
    /// Opaque payload.
    pub payload: Payload,
    /// Present on requests and on the replies that answer them.
    pub correlation_id: Option<CorrelationId>,
    /// Optional contract version.
    pub version: Option<u32>,
    /// Name of the sending consumer, if it gave one.
    pub sender: Option<String>,
}

impl Envelope {
    /// Wrap a payload for `channel`.
    pub fn new<T>(channel: impl Into<String>, kind: MessageKind, payload: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self::from_shared(channel, kind, Arc::new(payload))
    }

    /// Wrap an already shared payload.
    pub fn from_shared(channel: impl Into<String>, kind: MessageKind, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            kind,
            payload,
            correlation_id: None,
            version: None,
            sender: None,
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Borrow the payload as `T`, or `None` if it is something else.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        (*self.payload).downcast_ref::<T>()
    }

    /// Whether this envelope answers the request identified by `id`.
    #[must_use]
    pub fn answers(&self, id: CorrelationId) -> bool {
        self.kind.is_reply() && self.correlation_id == Some(id)
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("kind", &self.kind)
            .field("correlation_id", &self.correlation_id)
            .field("version", &self.version)
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}
