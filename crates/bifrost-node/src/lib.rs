//! # Bifrost Node
//!
//! Demo wiring of every Bifrost component in one process.
//!
//! ```text
//!  Node ──► EventBus ◄──── BusCache<Joke>
//!              │
//!        GalacticBridge ── LoopbackTransport ──► LoopbackBroker
//!                                                    │
//!                                                 servbot
//! ```
//!
//! ## Startup Sequence
//!
//! 1. Build the bus, broker, bridge and joke cache
//! 2. Spawn the request expiry sweep and the fabric event loop
//! 3. Connect the bridge and register the cache's mutation handler
//! 4. Ask servbot for a joke and cache it

pub mod config;
pub mod servbot;
pub mod telemetry;

use anyhow::{anyhow, Context, Result};
use bifrost_bus::EventBus;
use bifrost_cache::{BusCache, CacheItem, MutateStream};
use bifrost_fabric::{GalacticBridge, LoopbackBroker, LoopbackTransport};
use bifrost_types::ApiRequest;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::servbot::{Joke, JOKE_COMMAND};

impl CacheItem for Joke {
    fn type_tag(&self) -> &str {
        "joke"
    }
}

/// State tag of cached jokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JokeState {
    Told,
    Shouted,
}

/// Mutation offered for cached jokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JokeEdit {
    Shout,
}

pub type JokeCache = BusCache<Joke, JokeState, JokeEdit>;

pub struct Node {
    config: NodeConfig,
    bus: Arc<EventBus>,
    broker: Arc<LoopbackBroker>,
    bridge: Arc<GalacticBridge>,
    jokes: Arc<JokeCache>,
    shouter: Arc<MutateStream<Joke, JokeEdit>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate().context("invalid node configuration")?;
        info!(name = %config.bus.name, "Creating Bifrost node");

        let bus = EventBus::new(config.bus.clone());
        let broker = LoopbackBroker::new();
        servbot::install(&broker, &config.joke_channel);

        let transport = Arc::new(LoopbackTransport::new(Arc::clone(&broker)));
        let bridge = GalacticBridge::new(Arc::clone(&bus), transport, config.bridge.clone());
        bridge.bind::<Joke>(&config.joke_channel);

        let jokes = Arc::new(JokeCache::new(Arc::clone(&bus), &config.cache_name));
        let shouter = Arc::new(jokes.on_mutation_request("joke", &[JokeEdit::Shout]));

        Ok(Self {
            config,
            bus,
            broker,
            bridge,
            jokes,
            shouter,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub async fn start(&self) -> Result<()> {
        info!("===========================================");
        info!("  Bifrost Node v{}", env!("CARGO_PKG_VERSION"));
        info!("===========================================");

        let mut tasks = vec![self.bus.spawn_expiry_task()];
        tasks.extend(self.bridge.spawn_event_loop());
        self.tasks.lock().extend(tasks);

        self.bridge
            .connect()
            .await
            .context("failed to connect to the fabric")?;

        self.install_cache_handlers()?;
        self.jokes.initialized();

        let joke = self.tell_joke().await?;
        info!(joke = %joke.text, "Servbot says");
        let id = Uuid::new_v4();
        self.jokes.encache(id, joke.clone(), JokeState::Told);

        let jokes = Arc::downgrade(&self.jokes);
        let accepted = self.jokes.mutate(
            joke,
            JokeEdit::Shout,
            move |loud| {
                if let Some(jokes) = jokes.upgrade() {
                    jokes.encache(id, loud, JokeState::Shouted);
                }
            },
            |e| warn!(code = e.code, "Shout rejected: {}", e.message),
        );
        if !accepted {
            warn!("Nobody is handling joke mutations");
        }

        info!(
            channels = self.bus.channel_names().len(),
            cached = self.jokes.len(),
            "Bifrost node running"
        );
        Ok(())
    }

    fn install_cache_handlers(&self) -> Result<()> {
        self.jokes.when_ready(|| info!("Joke cache ready"));

        self.jokes
            .on_all_changes("joke", &[])
            .subscribe(|change| info!(id = %change.id, state = ?change.state, "Joke cache changed"))?;

        let shouter = Arc::downgrade(&self.shouter);
        self.shouter
            .subscribe(move |request| {
                if let Some(stream) = shouter.upgrade() {
                    let loud = Joke {
                        text: request.value.text.to_uppercase(),
                    };
                    stream.success(request, loud);
                }
            })?;
        Ok(())
    }

    /// Ask servbot for a joke over the fabric.
    pub async fn tell_joke(&self) -> Result<Joke> {
        let (tx, rx) = oneshot::channel();
        self.bridge.request_galactic(
            &self.config.joke_channel,
            ApiRequest::new(JOKE_COMMAND, Value::Null),
            move |response| {
                let _ = tx.send(response);
            },
        )?;

        let mut response = rx.await.context("joke request dropped")?;
        if let Some(e) = response.error.take() {
            return Err(anyhow!("servbot failed: {} ({})", e.message, e.code));
        }
        response
            .payload::<Joke>()
            .cloned()
            .ok_or_else(|| anyhow!("servbot answered with an unexpected payload"))
    }

    /// Disconnect the bridge and stop background tasks.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        if let Err(e) = self.bridge.disconnect().await {
            error!("Failed to disconnect cleanly: {}", e);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(
            handler_failures = self.bus.handler_failures(),
            broker_clients = self.broker.client_count(),
            "Shutdown complete"
        );
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn bridge(&self) -> &Arc<GalacticBridge> {
        &self.bridge
    }

    #[must_use]
    pub fn jokes(&self) -> &Arc<JokeCache> {
        &self.jokes
    }
}
