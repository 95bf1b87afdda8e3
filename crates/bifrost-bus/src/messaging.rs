//! Consumer-facing listen and send operations.

use crate::bus::{EventBus, ListenerHandle};
use crate::error::BusError;
use crate::handler::{ListenMode, MessageHandler};
use crate::registry::SubscribeOptions;
use bifrost_types::{ApiError, CorrelationId, Envelope, MessageKind};
use std::any::Any;
use std::sync::Arc;

impl EventBus {
    /// Responses and data on `channel` until closed.
    #[must_use]
    pub fn listen_stream(self: &Arc<Self>, channel: &str) -> MessageHandler {
        MessageHandler::new(Arc::clone(self), channel, ListenMode::Stream)
    }

    /// The next response or data envelope on `channel`.
    #[must_use]
    pub fn listen_once(self: &Arc<Self>, channel: &str) -> MessageHandler {
        MessageHandler::new(Arc::clone(self), channel, ListenMode::Once)
    }

    /// Requests on `channel` until closed.
    #[must_use]
    pub fn listen_request_stream(self: &Arc<Self>, channel: &str) -> MessageHandler {
        MessageHandler::new(Arc::clone(self), channel, ListenMode::RequestStream)
    }

    /// The next request on `channel`.
    #[must_use]
    pub fn listen_request_once(self: &Arc<Self>, channel: &str) -> MessageHandler {
        MessageHandler::new(Arc::clone(self), channel, ListenMode::RequestOnce)
    }

    /// Subscribe `handler` to every non-request envelope on `channel`.
    pub fn listen<F>(&self, channel: &str, handler: F) -> ListenerHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let options = SubscribeOptions::default().filter(|e| e.kind != MessageKind::Request);
        self.subscribe(channel, handler, options)
    }

    /// Answer every request on `channel` with `generate(request)`.
    ///
    /// The reply carries the request's correlation id and version.
    pub fn respond_stream<T, F>(
        self: &Arc<Self>,
        channel: &str,
        generate: F,
    ) -> Result<MessageHandler, BusError>
    where
        T: Any + Send + Sync,
        F: Fn(&Envelope) -> T + Send + Sync + 'static,
    {
        self.responder(channel, ListenMode::RequestStream, generate)
    }

    /// Answer the next request on `channel`, then stop.
    pub fn respond_once<T, F>(
        self: &Arc<Self>,
        channel: &str,
        generate: F,
    ) -> Result<MessageHandler, BusError>
    where
        T: Any + Send + Sync,
        F: Fn(&Envelope) -> T + Send + Sync + 'static,
    {
        self.responder(channel, ListenMode::RequestOnce, generate)
    }

    fn responder<T, F>(
        self: &Arc<Self>,
        channel: &str,
        mode: ListenMode,
        generate: F,
    ) -> Result<MessageHandler, BusError>
    where
        T: Any + Send + Sync,
        F: Fn(&Envelope) -> T + Send + Sync + 'static,
    {
        let handler = MessageHandler::new(Arc::clone(self), channel, mode);
        let bus = Arc::downgrade(self);
        handler.handle(move |request: &Envelope| {
            let Some(bus) = bus.upgrade() else {
                return;
            };
            let mut reply = Envelope::new(&request.channel, MessageKind::Response, generate(request));
            if let Some(id) = request.correlation_id {
                reply = reply.with_correlation_id(id);
            }
            if let Some(version) = request.version {
                reply = reply.with_version(version);
            }
            bus.publish(reply);
        })?;
        Ok(handler)
    }

    /// Broadcast a data envelope.
    pub fn send<T>(&self, channel: &str, payload: T)
    where
        T: Any + Send + Sync,
    {
        self.publish(Envelope::new(channel, MessageKind::Data, payload));
    }

    /// Publish a raw request. No response is tracked.
    pub fn send_request<T>(&self, channel: &str, payload: T, correlation_id: Option<CorrelationId>)
    where
        T: Any + Send + Sync,
    {
        self.publish(with_id(
            Envelope::new(channel, MessageKind::Request, payload),
            correlation_id,
        ));
    }

    pub fn send_response<T>(&self, channel: &str, payload: T, correlation_id: Option<CorrelationId>)
    where
        T: Any + Send + Sync,
    {
        self.publish(with_id(
            Envelope::new(channel, MessageKind::Response, payload),
            correlation_id,
        ));
    }

    pub fn send_error(&self, channel: &str, error: ApiError, correlation_id: Option<CorrelationId>) {
        self.publish(with_id(
            Envelope::new(channel, MessageKind::Error, error),
            correlation_id,
        ));
    }
}

fn with_id(envelope: Envelope, correlation_id: Option<CorrelationId>) -> Envelope {
    match correlation_id {
        Some(id) => envelope.with_correlation_id(id),
        None => envelope,
    }
}
