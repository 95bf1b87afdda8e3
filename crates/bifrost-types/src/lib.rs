//! # Bifrost Types
//!
//! Types shared by the bus, the galactic bridge and the cache.
//!
//! ## Design Principles
//!
//! - **Opaque payloads**: the bus never inspects what it carries. Payloads are
//!   typed at the API boundary and only serialized at the fabric edge.
//! - **Correlation by id**: every request/response pair is matched on a
//!   [`CorrelationId`], never on channel or arrival order.
//! - **One wire format**: [`FabricCommand`] is the only thing that crosses the
//!   fabric connection.

pub mod api;
pub mod correlation;
pub mod envelope;
pub mod fabric;

pub use api::{codes, ApiError, ApiRequest, ApiResponse};
pub use correlation::CorrelationId;
pub use envelope::{Envelope, MessageKind, Payload};
pub use fabric::{ConnectionState, FabricCommand, FabricFrame};
