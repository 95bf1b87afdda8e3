//! Inbound port: what a transport reports back to the bridge.

/// One event from the fabric connection.
///
/// Transports push these into the sender handed to
/// [`FabricTransport::connect`](super::FabricTransport::connect); the bridge
/// processes them in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text frame, expected to hold one JSON `FabricCommand`.
    Frame(String),
    /// The remote end closed the connection.
    Closed { reason: Option<String> },
    /// The connection broke.
    Error(String),
}

impl TransportEvent {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransportEvent::Frame(_))
    }
}
