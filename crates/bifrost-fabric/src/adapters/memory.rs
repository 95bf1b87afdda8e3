//! In-process loopback broker and its transport.
//!
//! The broker keeps per-client channel subscriptions, fans messages out to
//! subscribed clients and runs registered request services. Every frame
//! is serialized and parsed on the way through, so wire-format bugs show
//! up here as they would against a real broker.

use crate::error::TransportError;
use crate::ports::{FabricTransport, TransportEvent};
use async_trait::async_trait;
use bifrost_types::{ApiError, FabricCommand, FabricFrame, MessageKind};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A broker-side request service. Receives the request frame and returns
/// the response payload or an error.
pub type BrokerService = Arc<dyn Fn(&FabricFrame) -> Result<Value, ApiError> + Send + Sync>;

type ClientId = u64;

struct Client {
    events: mpsc::UnboundedSender<TransportEvent>,
    subscriptions: HashSet<String>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<ClientId, Client>,
    services: HashMap<String, BrokerService>,
    log: Vec<(ClientId, FabricCommand)>,
    next_client: ClientId,
}

/// In-memory fabric broker.
#[derive(Default)]
pub struct LoopbackBroker {
    state: Mutex<BrokerState>,
    refuse_connections: AtomicBool,
}

impl LoopbackBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer requests arriving on `channel` with `service`.
    pub fn register_service<F>(&self, channel: &str, service: F)
    where
        F: Fn(&FabricFrame) -> Result<Value, ApiError> + Send + Sync + 'static,
    {
        self.state
            .lock()
            .services
            .insert(channel.to_string(), Arc::new(service));
        debug!(channel = %channel, "Broker service registered");
    }

    /// Make subsequent connection attempts fail.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Push a message to every client subscribed to `channel`.
    pub fn publish(&self, channel: &str, kind: MessageKind, payload: Value) -> usize {
        let frame = FabricFrame {
            channel: channel.to_string(),
            kind,
            correlation_id: None,
            version: None,
            payload,
        };
        self.fan_out(None, &FabricCommand::Message { frame })
    }

    /// Send raw text to every connected client.
    pub fn inject_raw(&self, text: &str) {
        let state = self.state.lock();
        for client in state.clients.values() {
            let _ = client.events.send(TransportEvent::Frame(text.to_string()));
        }
    }

    /// Break every connection with `reason`.
    pub fn drop_connections(&self, reason: &str) {
        let clients: Vec<Client> = self.state.lock().clients.drain().map(|(_, c)| c).collect();
        warn!(clients = clients.len(), reason = %reason, "Broker dropping connections");
        for client in clients {
            let _ = client.events.send(TransportEvent::Error(reason.to_string()));
        }
    }

    /// Number of clients subscribed to `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .clients
            .values()
            .filter(|c| c.subscriptions.contains(channel))
            .count()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Every command received so far, in arrival order.
    #[must_use]
    pub fn received(&self) -> Vec<FabricCommand> {
        self.state.lock().log.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Count received commands matching `predicate`.
    pub fn count_received<P>(&self, predicate: P) -> usize
    where
        P: Fn(&FabricCommand) -> bool,
    {
        self.state
            .lock()
            .log
            .iter()
            .filter(|(_, c)| predicate(c))
            .count()
    }

    fn attach(&self, events: mpsc::UnboundedSender<TransportEvent>) -> Result<ClientId, TransportError> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(TransportError::Refused("broker unavailable".into()));
        }
        let mut state = self.state.lock();
        state.next_client += 1;
        let id = state.next_client;
        state.clients.insert(
            id,
            Client {
                events,
                subscriptions: HashSet::new(),
            },
        );
        debug!(client = id, "Broker client attached");
        Ok(id)
    }

    fn detach(&self, client: ClientId) {
        if self.state.lock().clients.remove(&client).is_some() {
            debug!(client, "Broker client detached");
        }
    }

    fn receive(&self, client: ClientId, text: &str) -> Result<(), TransportError> {
        let command = FabricCommand::from_json(text)
            .map_err(|e| TransportError::SendFailed(format!("broker rejected frame: {}", e)))?;

        let service = {
            let mut state = self.state.lock();
            if !state.clients.contains_key(&client) {
                return Err(TransportError::NotOpen);
            }
            state.log.push((client, command.clone()));
            match &command {
                FabricCommand::Subscribe { channel } => {
                    if let Some(c) = state.clients.get_mut(&client) {
                        c.subscriptions.insert(channel.clone());
                    }
                    None
                }
                FabricCommand::Unsubscribe { channel } => {
                    if let Some(c) = state.clients.get_mut(&client) {
                        c.subscriptions.remove(channel);
                    }
                    None
                }
                FabricCommand::Message { frame } if frame.kind == MessageKind::Request => {
                    state.services.get(&frame.channel).cloned()
                }
                FabricCommand::Message { .. } => None,
            }
        };
        trace!(client, channel = %command.channel(), "Broker received command");

        if let FabricCommand::Message { frame } = &command {
            self.fan_out(Some(client), &command);
            if let Some(service) = service {
                self.answer(frame, service);
            }
        }
        Ok(())
    }

    fn answer(&self, request: &FabricFrame, service: BrokerService) {
        let (kind, payload) = match service(request) {
            Ok(payload) => (MessageKind::Response, payload),
            Err(error) => (
                MessageKind::Error,
                serde_json::to_value(&error).unwrap_or(Value::Null),
            ),
        };
        let reply = FabricCommand::Message {
            frame: FabricFrame {
                channel: request.channel.clone(),
                kind,
                correlation_id: request.correlation_id,
                version: request.version,
                payload,
            },
        };
        self.fan_out(None, &reply);
    }

    /// Deliver to subscribers of the command's channel, skipping `except`.
    fn fan_out(&self, except: Option<ClientId>, command: &FabricCommand) -> usize {
        let text = match command.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Broker could not encode frame");
                return 0;
            }
        };
        let channel = command.channel();
        let state = self.state.lock();
        let mut delivered = 0;
        for (id, client) in &state.clients {
            if Some(*id) == except || !client.subscriptions.contains(channel) {
                continue;
            }
            if client.events.send(TransportEvent::Frame(text.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Transport connecting one bridge to a [`LoopbackBroker`].
pub struct LoopbackTransport {
    broker: Arc<LoopbackBroker>,
    client: Mutex<Option<ClientId>>,
}

impl LoopbackTransport {
    pub fn new(broker: Arc<LoopbackBroker>) -> Self {
        Self {
            broker,
            client: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.client.lock().is_some()
    }
}

#[async_trait]
impl FabricTransport for LoopbackTransport {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let id = self.broker.attach(events)?;
        if let Some(previous) = self.client.lock().replace(id) {
            self.broker.detach(previous);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        match self.client.lock().take() {
            Some(id) => {
                self.broker.detach(id);
                Ok(())
            }
            None => Err(TransportError::NotOpen),
        }
    }

    fn send(&self, frame: String) -> Result<(), TransportError> {
        let client = (*self.client.lock()).ok_or(TransportError::NotOpen)?;
        self.broker.receive(client, &frame)
    }
}
