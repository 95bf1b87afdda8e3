//! # Message Handlers
//!
//! Handle returned by `listen_*`. Nothing is subscribed until
//! [`MessageHandler::handle`] is called; [`MessageHandler::close`] ends the
//! subscription.

use crate::bus::{EventBus, ListenerHandle};
use crate::error::BusError;
use crate::registry::{HandlerFn, SubscribeOptions, SubscriptionId};
use bifrost_types::{Envelope, MessageKind};
use parking_lot::Mutex;
use std::sync::Arc;

/// Which envelopes a handler receives, and how many times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    /// Responses and data until closed.
    Stream,
    /// The first response or data envelope.
    Once,
    /// Requests until closed.
    RequestStream,
    /// The first request.
    RequestOnce,
}

impl ListenMode {
    #[must_use]
    pub fn is_once(self) -> bool {
        matches!(self, ListenMode::Once | ListenMode::RequestOnce)
    }

    #[must_use]
    pub fn is_request(self) -> bool {
        matches!(self, ListenMode::RequestStream | ListenMode::RequestOnce)
    }

    fn accepts(self, kind: MessageKind, has_error_handler: bool) -> bool {
        if self.is_request() {
            return kind == MessageKind::Request;
        }
        match kind {
            MessageKind::Request => false,
            MessageKind::Error => has_error_handler,
            MessageKind::Response | MessageKind::Data => true,
        }
    }
}

pub struct MessageHandler {
    bus: Arc<EventBus>,
    channel: String,
    mode: ListenMode,
    consumer: Option<String>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl MessageHandler {
    pub(crate) fn new(bus: Arc<EventBus>, channel: &str, mode: ListenMode) -> Self {
        Self {
            bus,
            channel: channel.to_string(),
            mode,
            consumer: None,
            listener: Mutex::new(None),
        }
    }

    /// Attribute the subscription to `consumer` so that
    /// `close(channel, consumer)` releases it.
    #[must_use]
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    /// Subscribe with a success handler only. Error envelopes are ignored.
    pub fn handle<F>(&self, success: F) -> Result<SubscriptionId, BusError>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.attach(Arc::new(success), None)
    }

    /// Subscribe with separate handlers for success and error envelopes.
    pub fn handle_with_error<F, E>(&self, success: F, error: E) -> Result<SubscriptionId, BusError>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
        E: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.attach(Arc::new(success), Some(Arc::new(error)))
    }

    fn attach(&self, success: HandlerFn, error: Option<HandlerFn>) -> Result<SubscriptionId, BusError> {
        let mut slot = self.listener.lock();
        if slot.is_some() {
            return Err(BusError::AlreadyHandling {
                channel: self.channel.clone(),
            });
        }

        let mode = self.mode;
        let has_error_handler = error.is_some();
        let mut options = SubscribeOptions {
            once: mode.is_once(),
            consumer: self.consumer.clone(),
            filter: None,
        };
        options = options.filter(move |e: &Envelope| mode.accepts(e.kind, has_error_handler));

        let route: HandlerFn = Arc::new(move |envelope: &Envelope| match (&error, envelope.kind) {
            (Some(on_error), MessageKind::Error) => on_error(envelope),
            _ => success(envelope),
        });

        let listener = self.bus.subscribe_shared(&self.channel, route, options);
        let id = listener.id();
        *slot = Some(listener);
        Ok(id)
    }

    /// Unsubscribe. Returns false if not subscribed or already closed.
    pub fn close(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(ListenerHandle::close)
    }

    /// True once the subscription has ended; false before `handle`.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(ListenerHandle::is_closed)
    }

    #[must_use]
    pub fn id(&self) -> Option<SubscriptionId> {
        self.listener.lock().as_ref().map(ListenerHandle::id)
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn mode(&self) -> ListenMode {
        self.mode
    }
}

impl std::fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageHandler")
            .field("channel", &self.channel)
            .field("mode", &self.mode)
            .field("consumer", &self.consumer)
            .field("id", &self.id())
            .finish()
    }
}
