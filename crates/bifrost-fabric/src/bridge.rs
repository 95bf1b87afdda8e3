//! # Galactic Bridge
//!
//! Extends local channels across the fabric connection.
//!
//! ```text
//!   local publish ──► EventBus ◄── inbound frame (decoded once)
//!                        │                ▲
//!        lifecycle hook  │                │ TransportEvent
//!                        ▼                │
//!                 GalacticBridge ──► FabricTransport ──► broker
//!                  subscribe / unsubscribe / message frames
//! ```
//!
//! The bridge is the only writer on the transport. Remote subscriptions
//! follow the bus's reference counting: the first local reference on a
//! galactic channel sends `subscribe`, teardown sends `unsubscribe`.

use crate::config::BridgeConfig;
use crate::connection::{ConnectionError, ConnectionErrorKind, ConnectionManager};
use crate::error::{BridgeError, FabricError, TransportError};
use crate::ports::{FabricTransport, TransportEvent};
use bifrost_bus::{ChannelLifecycle, EventBus, MessageHandler, MonitorEvent, RequestOptions};
use bifrost_types::{
    codes, ApiError, ApiRequest, ApiResponse, ConnectionState, CorrelationId, Envelope,
    FabricCommand, FabricFrame, MessageKind, Payload,
};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

/// Sender name stamped on envelopes that arrived over the fabric.
pub const FABRIC_SENDER: &str = "fabric";

type Decoder = Arc<dyn Fn(Value) -> Result<Payload, serde_json::Error> + Send + Sync>;

#[derive(Default)]
struct ChannelSets {
    /// Galactic channels with at least one local reference.
    active: HashSet<String>,
    /// Channels the broker currently forwards to us.
    remote: HashSet<String>,
}

pub struct GalacticBridge {
    bus: Arc<EventBus>,
    transport: Arc<dyn FabricTransport>,
    connection: ConnectionManager,
    config: BridgeConfig,
    decoders: RwLock<HashMap<String, Decoder>>,
    channels: Mutex<ChannelSets>,
    outbox: Mutex<VecDeque<FabricCommand>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl GalacticBridge {
    /// Create a bridge and register it as a lifecycle hook on `bus`.
    pub fn new(
        bus: Arc<EventBus>,
        transport: Arc<dyn FabricTransport>,
        config: BridgeConfig,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(Self {
            bus: Arc::clone(&bus),
            transport,
            connection: ConnectionManager::new(),
            config,
            decoders: RwLock::new(HashMap::new()),
            channels: Mutex::new(ChannelSets::default()),
            outbox: Mutex::new(VecDeque::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        });
        let hook: Arc<dyn ChannelLifecycle> = bridge.clone();
        bus.add_lifecycle_hook(Arc::downgrade(&hook));
        bridge
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // =========================================================================
    // CONNECTION
    // =========================================================================

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    #[must_use]
    pub fn state_stream(&self) -> WatchStream<ConnectionState> {
        self.connection.state_stream()
    }

    /// Connection-level error feed.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<ConnectionError> {
        self.connection.errors()
    }

    /// Open the fabric connection.
    ///
    /// On success the bridge subscribes every active galactic channel and
    /// flushes queued frames.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        self.connection.transition(ConnectionState::Connecting)?;
        match self.transport.connect(self.events_tx.clone()).await {
            Ok(()) => {
                self.connection.transition(ConnectionState::Connected)?;
                info!("Fabric connected");
                self.on_connected();
                Ok(())
            }
            Err(e) => {
                self.transport_failed(&e.to_string());
                Err(FabricError::Transport(e).into())
            }
        }
    }

    /// Close the fabric connection.
    ///
    /// Galactic requests still in flight receive a `TRANSPORT` error.
    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        self.connection.transition(ConnectionState::Disconnecting)?;
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "Transport disconnect reported an error");
        }
        self.channels.lock().remote.clear();
        self.connection.transition(ConnectionState::Disconnected)?;
        let failed = self.bus.fail_where(
            |pending| pending.galactic,
            ApiError::transport("fabric disconnected"),
        );
        info!(failed, "Fabric disconnected");
        Ok(())
    }

    /// Disconnect if connected, then connect.
    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        if self.connection.is_connected() {
            self.disconnect().await?;
        }
        self.connect().await
    }

    fn on_connected(&self) {
        let to_subscribe: Vec<String> = {
            let mut sets = self.channels.lock();
            let mut pending: Vec<String> = sets.active.difference(&sets.remote).cloned().collect();
            pending.sort();
            sets.remote.extend(pending.iter().cloned());
            pending
        };
        for channel in to_subscribe {
            debug!(channel = %channel, "Subscribing galactic channel");
            if self.send_now(&FabricCommand::Subscribe { channel }).is_err() {
                return;
            }
        }

        let queued: Vec<FabricCommand> = self.outbox.lock().drain(..).collect();
        if !queued.is_empty() {
            debug!(frames = queued.len(), "Flushing queued frames");
        }
        for command in queued {
            if self.send_now(&command).is_err() {
                return;
            }
        }
    }

    fn transport_failed(&self, reason: &str) {
        self.connection.fail(reason);
        self.channels.lock().remote.clear();
        let dropped = {
            let mut outbox = self.outbox.lock();
            let dropped = outbox.len();
            outbox.clear();
            dropped
        };
        let failed = self
            .bus
            .fail_where(|pending| pending.galactic, ApiError::transport(reason));
        warn!(failed, dropped, reason = %reason, "Failed in-flight galactic requests");
    }

    fn send_now(&self, command: &FabricCommand) -> Result<(), TransportError> {
        let text = command
            .to_json()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let result = self.transport.send(text);
        if let Err(e) = &result {
            self.transport_failed(&e.to_string());
        }
        result
    }

    /// Send now when connected, otherwise queue.
    fn dispatch(&self, command: FabricCommand) {
        if self.connection.is_connected() {
            let _ = self.send_now(&command);
        } else {
            self.outbox.lock().push_back(command);
        }
    }

    /// Fail fast or reserve queue room for a frame to `channel`.
    fn ensure_sendable(&self, channel: &str) -> Result<(), BridgeError> {
        if self.connection.is_connected() {
            return Ok(());
        }
        if !self.config.queue_while_disconnected {
            warn!(channel = %channel, state = %self.state(), "Fabric not connected");
            return Err(BridgeError::NotConnected {
                channel: channel.to_string(),
            });
        }
        if self.outbox.lock().len() >= self.config.max_queued_frames {
            return Err(BridgeError::QueueFull {
                channel: channel.to_string(),
                limit: self.config.max_queued_frames,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.outbox.lock().len()
    }

    // =========================================================================
    // GALACTIC OPERATIONS
    // =========================================================================

    /// Register the payload type of a galactic channel and bind it.
    ///
    /// Inbound frames on `channel` are decoded into `T` once, at the bridge.
    /// Channels without a registered type carry `serde_json::Value`.
    pub fn bind<T>(&self, channel: &str)
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let decoder: Decoder = Arc::new(|value: Value| {
            serde_json::from_value::<T>(value).map(|v| Arc::new(v) as Payload)
        });
        self.decoders.write().insert(channel.to_string(), decoder);
        self.bus.bind_galactic(channel);
    }

    /// Listen to a galactic channel. The remote subscription starts when
    /// the first local handler attaches.
    #[must_use]
    pub fn listen_galactic_stream(&self, channel: &str) -> MessageHandler {
        self.bus.bind_galactic(channel);
        self.bus.listen_stream(channel)
    }

    /// Send a request over the fabric and route its single response to
    /// `handler`.
    ///
    /// Fails with [`BridgeError::NotConnected`] without invoking `handler`
    /// when the fabric is down and queueing is disabled.
    pub fn request_galactic<T, F>(
        &self,
        channel: &str,
        request: ApiRequest<T>,
        handler: F,
    ) -> Result<CorrelationId, BridgeError>
    where
        T: Serialize,
        F: FnOnce(ApiResponse) + Send + 'static,
    {
        self.ensure_sendable(channel)?;
        let frame = FabricFrame {
            channel: channel.to_string(),
            kind: MessageKind::Request,
            correlation_id: Some(request.id),
            version: Some(request.version),
            payload: serde_json::to_value(&request)?,
        };

        self.bus.bind_galactic(channel);
        let options = RequestOptions::default()
            .version(request.version)
            .consumer(self.config.consumer.as_str())
            .galactic();
        self.bus
            .expect_response(request.id, channel, options, Box::new(handler))?;

        debug!(channel = %channel, correlation_id = %request.id, command = %request.command, "Galactic request");
        self.dispatch(FabricCommand::Message { frame });
        Ok(request.id)
    }

    /// Broadcast one data frame on a galactic channel.
    pub fn send_galactic<T>(&self, channel: &str, payload: &T) -> Result<(), BridgeError>
    where
        T: Serialize,
    {
        self.ensure_sendable(channel)?;
        let frame = FabricFrame {
            channel: channel.to_string(),
            kind: MessageKind::Data,
            correlation_id: None,
            version: None,
            payload: serde_json::to_value(payload)?,
        };
        self.dispatch(FabricCommand::Message { frame });
        Ok(())
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Process one transport event.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(text) => self.handle_frame(&text),
            TransportEvent::Closed { reason } => {
                if self.expects_traffic() {
                    let reason = reason.unwrap_or_else(|| "connection closed by remote".to_string());
                    self.transport_failed(&reason);
                }
            }
            TransportEvent::Error(reason) => {
                if self.expects_traffic() {
                    self.transport_failed(&reason);
                }
            }
        }
    }

    fn expects_traffic(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        )
    }

    /// Handle every event queued so far. Returns how many were handled.
    ///
    /// Does nothing once [`GalacticBridge::spawn_event_loop`] owns the
    /// receiver.
    pub fn pump(&self) -> usize {
        let events: Vec<TransportEvent> = {
            let mut guard = self.events_rx.lock();
            let Some(rx) = guard.as_mut() else {
                return 0;
            };
            let mut events = Vec::new();
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
            events
        };
        let count = events.len();
        for event in events {
            self.handle_event(event);
        }
        count
    }

    /// Process transport events on a background task until the bridge is
    /// dropped. Returns `None` if the loop is already running.
    pub fn spawn_event_loop(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.events_rx.lock().take()?;
        let weak: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(bridge) = weak.upgrade() else {
                    break;
                };
                bridge.handle_event(event);
            }
            debug!("Fabric event loop stopped");
        }))
    }

    fn handle_frame(&self, text: &str) {
        let command = match FabricCommand::from_json(text) {
            Ok(command) => command,
            Err(e) => {
                self.decode_failed("<unknown>", &e.to_string());
                return;
            }
        };
        match command {
            FabricCommand::Message { frame } => self.inbound(frame),
            other => debug!(channel = %other.channel(), "Ignoring broker control frame"),
        }
    }

    fn inbound(&self, frame: FabricFrame) {
        if !self.bus.is_galactic(&frame.channel) {
            debug!(channel = %frame.channel, "Frame for unbound channel dropped");
            return;
        }

        let payload: Payload = if frame.kind == MessageKind::Error {
            Arc::new(decode_api_error(frame.payload))
        } else {
            let decoder = self.decoders.read().get(&frame.channel).cloned();
            match decoder {
                Some(decode) => match decode(frame.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        self.decode_failed(&frame.channel, &e.to_string());
                        return;
                    }
                },
                None => Arc::new(frame.payload),
            }
        };

        let mut envelope =
            Envelope::from_shared(frame.channel, frame.kind, payload).with_sender(FABRIC_SENDER);
        if let Some(id) = frame.correlation_id {
            envelope = envelope.with_correlation_id(id);
        }
        if let Some(version) = frame.version {
            envelope = envelope.with_version(version);
        }
        self.bus.publish(envelope);
    }

    fn decode_failed(&self, channel: &str, reason: &str) {
        warn!(channel = %channel, reason = %reason, "Fabric frame decode failed");
        self.connection.report(ConnectionError {
            kind: ConnectionErrorKind::Decode,
            channel: Some(channel.to_string()),
            message: reason.to_string(),
        });
        self.bus.report(MonitorEvent::FabricDecodeFailed {
            channel: channel.to_string(),
            reason: reason.to_string(),
        });
    }
}

impl ChannelLifecycle for GalacticBridge {
    fn galactic_activated(&self, channel: &str) {
        let subscribe_now = {
            let mut sets = self.channels.lock();
            sets.active.insert(channel.to_string());
            self.connection.is_connected() && sets.remote.insert(channel.to_string())
        };
        if subscribe_now {
            debug!(channel = %channel, "Remote subscribe");
            let _ = self.send_now(&FabricCommand::Subscribe {
                channel: channel.to_string(),
            });
        }
    }

    fn galactic_released(&self, channel: &str) {
        let unsubscribe_now = {
            let mut sets = self.channels.lock();
            sets.active.remove(channel);
            sets.remote.remove(channel) && self.connection.is_connected()
        };
        if unsubscribe_now {
            debug!(channel = %channel, "Remote unsubscribe");
            let _ = self.send_now(&FabricCommand::Unsubscribe {
                channel: channel.to_string(),
            });
        }
    }
}

impl std::fmt::Debug for GalacticBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GalacticBridge")
            .field("state", &self.state())
            .field("queued", &self.queued_frames())
            .finish_non_exhaustive()
    }
}

fn decode_api_error(value: Value) -> ApiError {
    serde_json::from_value::<ApiError>(value.clone()).unwrap_or_else(|_| {
        ApiError::with_data(codes::INTERNAL_ERROR, "unrecognised error payload", value)
    })
}
