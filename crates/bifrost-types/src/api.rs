//! API request/response shapes and error codes.
//!
//! Error codes follow the JSON-RPC 2.0 layout: standard codes in the
//! -32700..-32600 band, bus-specific codes in the -32000 server band.

use crate::correlation::CorrelationId;
use crate::envelope::{Envelope, MessageKind, Payload};
use serde::{Deserialize, Serialize};
use std::any::Any;
use thiserror::Error;

/// Error codes carried by [`ApiError`].
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const INTERNAL_ERROR: i32 = -32603;

    /// No response arrived inside the request timeout window.
    pub const TIMEOUT: i32 = -32006;
    /// The fabric connection failed while the request was in flight.
    pub const TRANSPORT: i32 = -32007;
    /// The fabric is not connected and the request was not queued.
    pub const NOT_CONNECTED: i32 = -32008;
    /// A mutation handler rejected the mutation.
    pub const MUTATION_FAILED: i32 = -32020;
    /// Nothing is registered to handle the request.
    pub const NO_HANDLER: i32 = -32021;
}

/// Error answer to a request.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct ApiError {
    /// JSON-RPC style error code
    pub code: i32,
    /// Human readable message
    pub message: String,
    /// Optional structured detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i32, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Request timeout
    pub fn timeout(channel: &str) -> Self {
        Self::new(
            codes::TIMEOUT,
            format!("Request timeout on channel: {}", channel),
        )
    }

    /// Transport failure while the request was in flight
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::new(
            codes::TRANSPORT,
            format!("Transport failure: {}", reason.into()),
        )
    }

    pub fn not_connected(channel: &str) -> Self {
        Self::new(
            codes::NOT_CONNECTED,
            format!("Fabric not connected, cannot reach channel: {}", channel),
        )
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(
            codes::INTERNAL_ERROR,
            format!("Internal error: {}", details.into()),
        )
    }
}

/// A command addressed to a service channel.
///
/// The `id` doubles as the correlation id of the request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest<T = serde_json::Value> {
    pub id: CorrelationId,
    pub command: String,
    pub payload: T,
    pub version: u32,
}

impl<T> ApiRequest<T> {
    pub fn new(command: impl Into<String>, payload: T) -> Self {
        Self {
            id: CorrelationId::new(),
            command: command.into(),
            payload,
            version: 1,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: CorrelationId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

/// What a request handler receives: exactly one per request.
#[derive(Clone)]
pub struct ApiResponse {
    /// Correlation id of the request this answers.
    pub id: CorrelationId,
    /// Response payload. Absent on synthesized errors.
    pub payload: Option<Payload>,
    /// Set when the request failed.
    pub error: Option<ApiError>,
    pub version: Option<u32>,
}

impl ApiResponse {
    /// Build from a `Response` or `Error` envelope.
    pub fn from_envelope(id: CorrelationId, envelope: &Envelope) -> Self {
        let error = match envelope.kind {
            MessageKind::Error => Some(
                envelope
                    .payload::<ApiError>()
                    .cloned()
                    .unwrap_or_else(|| ApiError::internal("unrecognised error payload")),
            ),
            _ => None,
        };
        Self {
            id,
            payload: Some(envelope.payload.clone()),
            error,
            version: envelope.version,
        }
    }

    /// A response that never came from a responder.
    pub fn synthesized(id: CorrelationId, error: ApiError) -> Self {
        Self {
            id,
            payload: None,
            error: Some(error),
            version: None,
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Borrow the payload as `T`.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload
            .as_ref()
            .and_then(|p| (**p).downcast_ref::<T>())
    }
}

impl std::fmt::Debug for ApiResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiResponse")
            .field("id", &self.id)
            .field("has_payload", &self.payload.is_some())
            .field("error", &self.error)
            .field("version", &self.version)
            .finish()
    }
}
