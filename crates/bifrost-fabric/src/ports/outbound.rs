//! Outbound port: the connection to the remote broker.

use super::inbound::TransportEvent;
use crate::error::TransportError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A bidirectional text-frame connection to the fabric.
#[async_trait]
pub trait FabricTransport: Send + Sync {
    /// Open the connection. Everything received afterwards goes to `events`.
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Queue one frame for sending.
    ///
    /// Called from inside bus handlers, so it must not wait on the network.
    fn send(&self, frame: String) -> Result<(), TransportError>;
}
