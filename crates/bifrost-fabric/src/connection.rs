//! # Fabric Connection Manager
//!
//! Holds the current [`ConnectionState`] and enforces the state machine.
//!
//! The state is a `watch` value: observers always see the latest state and
//! never a backlog. Connection-level errors go to a separate broadcast feed.

use crate::error::FabricError;
use bifrost_types::ConnectionState;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error};

/// What went wrong on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// The transport failed; the connection is now `Failed`.
    Transport,
    /// A frame could not be decoded; the connection stays up.
    Decode,
}

/// One entry on the error feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub channel: Option<String>,
    pub message: String,
}

const ERROR_FEED_CAPACITY: usize = 64;

pub struct ConnectionManager {
    state: watch::Sender<ConnectionState>,
    errors: broadcast::Sender<ConnectionError>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (errors, _) = broadcast::channel(ERROR_FEED_CAPACITY);
        Self { state, errors }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Move to `next`. Returns the previous state.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, FabricError> {
        let mut outcome = Err(FabricError::InvalidTransition {
            from: self.state(),
            to: next,
        });
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                outcome = Ok(*current);
                *current = next;
                true
            } else {
                outcome = Err(FabricError::InvalidTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        if let Ok(previous) = &outcome {
            debug!(from = %previous, to = %next, "Fabric connection state changed");
        }
        outcome
    }

    /// Enter `Failed` from any state and publish the reason on the error feed.
    pub fn fail(&self, reason: &str) -> ConnectionState {
        let previous = self.state.send_replace(ConnectionState::Failed);
        error!(from = %previous, reason = %reason, "Fabric connection failed");
        self.report(ConnectionError {
            kind: ConnectionErrorKind::Transport,
            channel: None,
            message: reason.to_string(),
        });
        previous
    }

    /// Publish an error without changing state.
    pub fn report(&self, error: ConnectionError) {
        let _ = self.errors.send(error);
    }

    /// Receiver that always holds the latest state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Stream yielding the current state, then every change.
    #[must_use]
    pub fn state_stream(&self) -> WatchStream<ConnectionState> {
        WatchStream::new(self.state.subscribe())
    }

    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<ConnectionError> {
        self.errors.subscribe()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish()
    }
}
