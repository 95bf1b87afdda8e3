//! # Ports
//!
//! - [`inbound`]: events a transport delivers to the bridge.
//! - [`outbound`]: the transport the bridge drives.

pub mod inbound;
pub mod outbound;

pub use inbound::TransportEvent;
pub use outbound::FabricTransport;
