//! # Bus Monitor
//!
//! Broadcast feed of bus lifecycle events.
//!
//! The monitor never affects delivery: when nobody listens the events are
//! discarded, and a receiver that falls behind skips ahead.

use crate::registry::SubscriptionId;
use bifrost_types::{CorrelationId, MessageKind};
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::debug;

/// Something that happened inside the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    ChannelCreated {
        channel: String,
    },
    ChannelDestroyed {
        channel: String,
    },
    Subscribed {
        channel: String,
        id: SubscriptionId,
    },
    Unsubscribed {
        channel: String,
        id: SubscriptionId,
    },
    /// An envelope was published to a channel with no subscribers.
    Dropped {
        channel: String,
        kind: MessageKind,
    },
    /// A handler panicked; delivery continued with the next subscriber.
    HandlerFailed {
        channel: String,
        id: SubscriptionId,
        message: String,
    },
    RequestTimedOut {
        channel: String,
        correlation_id: CorrelationId,
    },
    GalacticBound {
        channel: String,
    },
    GalacticUnbound {
        channel: String,
    },
    /// A frame arrived from the fabric that could not be decoded.
    FabricDecodeFailed {
        channel: String,
        reason: String,
    },
    Reset,
}

impl MonitorEvent {
    /// Channel the event concerns, if any.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            MonitorEvent::ChannelCreated { channel }
            | MonitorEvent::ChannelDestroyed { channel }
            | MonitorEvent::Subscribed { channel, .. }
            | MonitorEvent::Unsubscribed { channel, .. }
            | MonitorEvent::Dropped { channel, .. }
            | MonitorEvent::HandlerFailed { channel, .. }
            | MonitorEvent::RequestTimedOut { channel, .. }
            | MonitorEvent::GalacticBound { channel }
            | MonitorEvent::GalacticUnbound { channel }
            | MonitorEvent::FabricDecodeFailed { channel, .. } => Some(channel),
            MonitorEvent::Reset => None,
        }
    }
}

/// Errors from monitor receivers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// The bus was dropped.
    #[error("Monitor closed")]
    Closed,
}

#[derive(Debug)]
pub(crate) struct Monitor {
    sender: broadcast::Sender<MonitorEvent>,
}

impl Monitor {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn emit(&self, event: MonitorEvent) {
        // An error only means there are no receivers.
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> MonitorSubscription {
        MonitorSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub(crate) fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving end of the monitor feed.
pub struct MonitorSubscription {
    receiver: broadcast::Receiver<MonitorEvent>,
}

impl MonitorSubscription {
    /// Wait for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<MonitorEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    debug!(lagged = count, "Monitor receiver lagged, events skipped");
                }
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Result<Option<MonitorEvent>, MonitorError> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Ok(Some(event)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Closed) => return Err(MonitorError::Closed),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Drain everything queued right now.
    pub fn drain(&mut self) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = self.try_recv() {
            events.push(event);
        }
        events
    }

    #[must_use]
    pub fn into_stream(self) -> MonitorStream {
        MonitorStream {
            inner: BroadcastStream::new(self.receiver),
        }
    }
}

/// [`Stream`] of monitor events.
pub struct MonitorStream {
    inner: BroadcastStream<MonitorEvent>,
}

impl Stream for MonitorStream {
    type Item = MonitorEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(count)))) => {
                    debug!(lagged = count, "Monitor stream lagged, events skipped");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
