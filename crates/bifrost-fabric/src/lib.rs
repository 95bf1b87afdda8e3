//! # Bifrost Fabric - Galactic Channels
//!
//! Connects an [`EventBus`](bifrost_bus::EventBus) to a remote broker so that
//! selected channels span processes.
//!
//! ## Architecture
//!
//! - [`connection`]: connection state machine, observable as a stream.
//! - [`bridge`]: the galactic bridge (outbound frames, inbound republish).
//! - [`ports`]: the transport port the bridge drives.
//! - [`adapters`]: the in-process loopback broker.
//!
//! ## Failure Semantics
//!
//! Transport failures move the connection to `Failed` and answer every
//! in-flight galactic request with a `TRANSPORT` error. Undecodable frames
//! are reported on the error feed and never reach local subscribers.

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod adapters;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod error;
pub mod ports;

pub use adapters::{LoopbackBroker, LoopbackTransport};
pub use bridge::{GalacticBridge, FABRIC_SENDER};
pub use config::{BridgeConfig, ConfigError};
pub use connection::{ConnectionError, ConnectionErrorKind, ConnectionManager};
pub use error::{BridgeError, FabricError, TransportError};
pub use ports::{FabricTransport, TransportEvent};
