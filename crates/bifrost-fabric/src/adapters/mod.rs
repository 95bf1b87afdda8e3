//! # Adapters
//!
//! Implementations of the outbound transport port.

mod memory;

pub use memory::{BrokerService, LoopbackBroker, LoopbackTransport};
