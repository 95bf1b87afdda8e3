//! # Event Bus
//!
//! The local pub/sub core: channel registry, dispatch queue, correlator
//! and monitor behind one handle.
//!
//! ## Concurrency
//!
//! - Registry and pending-request state sit behind `parking_lot` mutexes.
//! - No lock is held while a handler runs.
//! - All deliveries go through one dispatch queue, so handlers are
//!   serialized and per-channel FIFO holds even for re-entrant publishes.
//!
//! ## Lifecycle hooks
//!
//! Components that care about channel lifetime (the galactic bridge)
//! register a [`ChannelLifecycle`] hook. Hooks are held weakly and called
//! after every lock is released.

use crate::config::{BusConfig, MAX_REQUEST_TIMEOUT};
use crate::correlator::{Correlator, PendingRequest, PendingRequestInfo, ResponseCallback};
use crate::dispatch::{Dispatcher, Task};
use crate::error::BusError;
use crate::monitor::{Monitor, MonitorEvent, MonitorSubscription};
use crate::registry::{
    ChannelInfo, ChannelRegistry, Delivery, HandlerFn, Lifecycle, SubscribeOptions,
    SubscriptionId,
};
use bifrost_types::{ApiError, ApiResponse, CorrelationId, Envelope, MessageKind};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Notified when galactic channels gain their first reference or are
/// torn down.
pub trait ChannelLifecycle: Send + Sync {
    /// A galactic channel took its first local reference.
    fn galactic_activated(&self, channel: &str);

    /// A galactic channel was torn down.
    fn galactic_released(&self, channel: &str);
}

/// Options for [`EventBus::request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Contract version stamped on the request envelope.
    pub version: Option<u32>,
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
    /// Consumer that owns the response listener.
    pub consumer: Option<String>,
    /// Mark the request as travelling over the fabric.
    pub galactic: bool,
    /// Channel the responses arrive on, when it differs from the request
    /// channel.
    pub return_channel: Option<String>,
}

impl RequestOptions {
    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    #[must_use]
    pub fn galactic(mut self) -> Self {
        self.galactic = true;
        self
    }

    #[must_use]
    pub fn return_channel(mut self, channel: impl Into<String>) -> Self {
        self.return_channel = Some(channel.into());
        self
    }
}

/// Handle on one subscription.
///
/// Dropping the handle does not unsubscribe; call [`ListenerHandle::close`].
#[derive(Clone)]
pub struct ListenerHandle {
    id: SubscriptionId,
    channel: String,
    bus: Weak<EventBus>,
}

impl ListenerHandle {
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Unsubscribe. Returns false if already closed.
    pub fn close(&self) -> bool {
        self.bus.upgrade().is_some_and(|bus| bus.unsubscribe(self.id))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.bus
            .upgrade()
            .map_or(true, |bus| !bus.is_subscribed(self.id))
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

/// In-process message bus.
pub struct EventBus {
    config: BusConfig,
    registry: Mutex<ChannelRegistry>,
    dispatcher: Dispatcher,
    correlator: Correlator,
    monitor: Monitor,
    hooks: RwLock<Vec<Weak<dyn ChannelLifecycle>>>,
    handler_failures: AtomicU64,
    weak_self: Weak<EventBus>,
}

impl EventBus {
    /// Create a bus with the given configuration.
    pub fn new(config: BusConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            monitor: Monitor::new(config.monitor_capacity),
            config,
            registry: Mutex::new(ChannelRegistry::new()),
            dispatcher: Dispatcher::new(),
            correlator: Correlator::new(),
            hooks: RwLock::new(Vec::new()),
            handler_failures: AtomicU64::new(0),
            weak_self: weak_self.clone(),
        })
    }

    /// Create a bus after validating `config`.
    pub fn try_new(config: BusConfig) -> Result<Arc<Self>, BusError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(BusConfig::default())
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // =========================================================================
    // CHANNELS
    // =========================================================================

    /// Create the channel if it does not exist yet.
    pub fn open(&self, channel: &str) {
        let changes = self.registry.lock().open(channel);
        self.apply(changes);
    }

    /// Register `handler` on `channel`.
    pub fn subscribe<F>(&self, channel: &str, handler: F, options: SubscribeOptions) -> ListenerHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe_shared(channel, Arc::new(handler), options)
    }

    pub(crate) fn subscribe_shared(
        &self,
        channel: &str,
        handler: HandlerFn,
        options: SubscribeOptions,
    ) -> ListenerHandle {
        let (id, changes) = self.registry.lock().subscribe(channel, handler, options);
        self.apply(changes);
        ListenerHandle {
            id,
            channel: channel.to_string(),
            bus: self.weak_self.clone(),
        }
    }

    /// Close one subscription. Returns false if it was already closed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let changes = self.registry.lock().unsubscribe(id);
        match changes {
            Some(changes) => {
                self.apply(changes);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.registry.lock().is_active(id)
    }

    /// Release everything `consumer` holds on `channel`.
    ///
    /// Pending requests whose listener belonged to `consumer` are discarded
    /// without invoking their handlers. Returns the number of subscriptions
    /// released.
    pub fn close(&self, channel: &str, consumer: &str) -> usize {
        let (released, changes) = self.registry.lock().release_consumer(channel, consumer);
        let discarded = self.correlator.discard_subscriptions(&released);
        if discarded > 0 {
            debug!(channel = %channel, consumer = %consumer, discarded, "Discarded pending requests");
        }
        self.apply(changes);
        released.len()
    }

    /// Mark `channel` as bridged to the fabric.
    pub fn bind_galactic(&self, channel: &str) {
        let changes = self.registry.lock().bind_galactic(channel);
        self.apply(changes);
    }

    #[must_use]
    pub fn is_galactic(&self, channel: &str) -> bool {
        self.channel_info(channel).is_some_and(|c| c.galactic)
    }

    /// Whether publishing `envelope` now would reach at least one handler.
    #[must_use]
    pub fn has_receiver(&self, envelope: &Envelope) -> bool {
        self.registry.lock().accepts(envelope)
    }

    #[must_use]
    pub fn has_channel(&self, channel: &str) -> bool {
        self.registry.lock().contains(channel)
    }

    #[must_use]
    pub fn channel_info(&self, channel: &str) -> Option<ChannelInfo> {
        self.registry.lock().info(channel)
    }

    #[must_use]
    pub fn channel_names(&self) -> Vec<String> {
        self.registry.lock().channel_names()
    }

    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channel_info(channel).map_or(0, |c| c.ref_count)
    }

    // =========================================================================
    // PUBLISH
    // =========================================================================

    /// Deliver `envelope` to every subscriber of its channel.
    ///
    /// Publishing to a channel without subscribers drops the envelope; the
    /// channel is not created.
    pub fn publish(&self, envelope: Envelope) {
        self.submit(Task::Publish(envelope));
    }

    fn submit(&self, task: Task) {
        self.dispatcher.submit(task, |task| self.execute(task));
    }

    fn execute(&self, task: Task) {
        match task {
            Task::Publish(envelope) => self.deliver(&envelope),
            Task::Invoke { channel, job } => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                    let message = panic_message(panic.as_ref());
                    error!(channel = %channel, "Response handler panicked: {}", message);
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn deliver(&self, envelope: &Envelope) {
        let subscribers = self.registry.lock().subscribers(&envelope.channel);
        if subscribers.is_empty() {
            warn!(channel = %envelope.channel, kind = %envelope.kind, "No subscribers, envelope dropped");
            self.monitor.emit(MonitorEvent::Dropped {
                channel: envelope.channel.clone(),
                kind: envelope.kind,
            });
            return;
        }

        for id in subscribers {
            // Closed subscriptions are skipped even mid-dispatch.
            let taken = self.registry.lock().take_for_delivery(id, envelope);
            let Some(Delivery {
                handler,
                mut changes,
                hold,
            }) = taken
            else {
                continue;
            };
            trace!(channel = %envelope.channel, subscription = %id, "Delivering envelope");
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                let message = panic_message(panic.as_ref());
                error!(
                    channel = %envelope.channel,
                    subscription = %id,
                    "Handler panicked: {}",
                    message
                );
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
                self.monitor.emit(MonitorEvent::HandlerFailed {
                    channel: envelope.channel.clone(),
                    id,
                    message,
                });
            }
            // The channel outlives the handler so a re-subscription keeps it.
            if let Some(hold) = hold {
                changes.extend(self.registry.lock().finish_delivery(hold));
            }
            self.apply(changes);
        }
    }

    // =========================================================================
    // REQUEST / RESPONSE
    // =========================================================================

    /// Send a request and route exactly one response to `handler`.
    ///
    /// Returns the correlation id immediately. The handler receives either
    /// the matching `Response`/`Error` envelope or a synthesized timeout.
    pub fn request<T, F>(
        &self,
        channel: &str,
        payload: T,
        options: RequestOptions,
        handler: F,
    ) -> Result<CorrelationId, BusError>
    where
        T: Any + Send + Sync,
        F: FnOnce(ApiResponse) + Send + 'static,
    {
        self.request_with_id(CorrelationId::new(), channel, payload, options, handler)
    }

    /// [`EventBus::request`] with a caller-supplied correlation id.
    pub fn request_with_id<T, F>(
        &self,
        id: CorrelationId,
        channel: &str,
        payload: T,
        options: RequestOptions,
        handler: F,
    ) -> Result<CorrelationId, BusError>
    where
        T: Any + Send + Sync,
        F: FnOnce(ApiResponse) + Send + 'static,
    {
        let version = options.version;
        self.expect_response(id, channel, options, Box::new(handler))?;
        self.send_request_envelope(id, channel, payload, version);
        Ok(id)
    }

    /// Send a request whose responder answers any number of times.
    ///
    /// Every `Response`/`Error` envelope carrying the request's id reaches
    /// `handler` until the returned handle is closed. Stream requests have
    /// no timeout and are not tracked as pending.
    pub fn request_stream<T, F>(
        &self,
        channel: &str,
        payload: T,
        options: RequestOptions,
        handler: F,
    ) -> Result<ListenerHandle, BusError>
    where
        T: Any + Send + Sync,
        F: Fn(ApiResponse) + Send + Sync + 'static,
    {
        self.request_stream_with_id(CorrelationId::new(), channel, payload, options, handler)
    }

    /// [`EventBus::request_stream`] with a caller-supplied correlation id.
    pub fn request_stream_with_id<T, F>(
        &self,
        id: CorrelationId,
        channel: &str,
        payload: T,
        options: RequestOptions,
        handler: F,
    ) -> Result<ListenerHandle, BusError>
    where
        T: Any + Send + Sync,
        F: Fn(ApiResponse) + Send + Sync + 'static,
    {
        if self.correlator.contains(id) {
            return Err(BusError::DuplicateCorrelationId(id));
        }
        let return_channel = options.return_channel.as_deref().unwrap_or(channel);
        let mut listen = SubscribeOptions::default().filter(move |e: &Envelope| e.answers(id));
        listen.consumer = options.consumer.clone();
        let listener = self.subscribe_shared(
            return_channel,
            Arc::new(move |envelope: &Envelope| handler(ApiResponse::from_envelope(id, envelope))),
            listen,
        );
        self.send_request_envelope(id, channel, payload, options.version);
        Ok(listener)
    }

    fn send_request_envelope<T>(
        &self,
        id: CorrelationId,
        channel: &str,
        payload: T,
        version: Option<u32>,
    ) where
        T: Any + Send + Sync,
    {
        let mut envelope =
            Envelope::new(channel, MessageKind::Request, payload).with_correlation_id(id);
        if let Some(version) = version {
            envelope = envelope.with_version(version);
        }
        debug!(channel = %channel, correlation_id = %id, "Sending request");
        self.publish(envelope);
    }

    /// Register a pending record and its response listener without
    /// publishing anything.
    ///
    /// Used when the request itself leaves through another path, such as
    /// the fabric.
    pub fn expect_response(
        &self,
        id: CorrelationId,
        channel: &str,
        options: RequestOptions,
        callback: ResponseCallback,
    ) -> Result<(), BusError> {
        if self.correlator.contains(id) {
            return Err(BusError::DuplicateCorrelationId(id));
        }

        let weak = self.weak_self.clone();
        let mut listen = SubscribeOptions::once().filter(move |e: &Envelope| e.answers(id));
        listen.consumer = options.consumer;
        let return_channel = options.return_channel.as_deref().unwrap_or(channel);
        let listener = self.subscribe_shared(
            return_channel,
            Arc::new(move |envelope: &Envelope| {
                if let Some(bus) = weak.upgrade() {
                    bus.resolve(id, envelope);
                }
            }),
            listen,
        );

        let timeout = options
            .timeout
            .unwrap_or(self.config.request_timeout)
            .min(MAX_REQUEST_TIMEOUT);
        let now = Instant::now();
        let record = PendingRequest {
            channel: channel.to_string(),
            subscription: listener.id(),
            deadline: now.checked_add(timeout).unwrap_or(now),
            galactic: options.galactic,
            callback,
        };
        if self.correlator.register(id, record).is_err() {
            self.unsubscribe(listener.id());
            return Err(BusError::DuplicateCorrelationId(id));
        }
        Ok(())
    }

    fn resolve(&self, id: CorrelationId, envelope: &Envelope) {
        match self.correlator.take(id) {
            Some(record) => {
                debug!(channel = %envelope.channel, correlation_id = %id, kind = %envelope.kind, "Request resolved");
                (record.callback)(ApiResponse::from_envelope(id, envelope));
            }
            None => {
                warn!(channel = %envelope.channel, correlation_id = %id, "Response for unknown correlation id");
            }
        }
    }

    /// Discard one pending request without invoking its handler.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        match self.correlator.take(id) {
            Some(record) => {
                debug!(channel = %record.channel, correlation_id = %id, "Request cancelled");
                self.unsubscribe(record.subscription);
                true
            }
            None => false,
        }
    }

    /// Time out every overdue request. Returns how many expired.
    pub fn expire_overdue(&self) -> usize {
        let expired = self.correlator.take_expired(Instant::now());
        let count = expired.len();
        for (id, record) in expired {
            warn!(channel = %record.channel, correlation_id = %id, "Request timed out");
            self.monitor.emit(MonitorEvent::RequestTimedOut {
                channel: record.channel.clone(),
                correlation_id: id,
            });
            let error = ApiError::timeout(&record.channel);
            self.fail_record(id, record, error);
        }
        count
    }

    /// Fail the pending requests `predicate` selects with `error`.
    pub fn fail_where<P>(&self, predicate: P, error: ApiError) -> usize
    where
        P: Fn(&PendingRequestInfo) -> bool,
    {
        let failed = self.correlator.take_where(predicate);
        let count = failed.len();
        for (id, record) in failed {
            debug!(channel = %record.channel, correlation_id = %id, code = error.code, "Failing pending request");
            self.fail_record(id, record, error.clone());
        }
        count
    }

    fn fail_record(&self, id: CorrelationId, record: PendingRequest, error: ApiError) {
        self.unsubscribe(record.subscription);
        let callback = record.callback;
        self.submit(Task::Invoke {
            channel: record.channel,
            job: Box::new(move || callback(ApiResponse::synthesized(id, error))),
        });
    }

    #[must_use]
    pub fn pending_requests(&self) -> Vec<PendingRequestInfo> {
        self.correlator.snapshot()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.correlator.len()
    }

    /// Run [`EventBus::expire_overdue`] on the configured interval.
    ///
    /// The task ends once the bus is dropped.
    pub fn spawn_expiry_task(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.config.expiry_sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(bus) = weak.upgrade() else {
                    debug!("Bus dropped, expiry task stopping");
                    break;
                };
                let expired = bus.expire_overdue();
                if expired > 0 {
                    trace!(expired, "Expiry sweep");
                }
            }
        })
    }

    // =========================================================================
    // RESET / OBSERVATION
    // =========================================================================

    /// Drop every channel, subscription, queued delivery and pending request.
    pub fn reset(&self) {
        let changes = self.registry.lock().clear();
        let discarded = self.correlator.clear();
        let dropped = self.dispatcher.clear();
        info!(bus = %self.config.name, discarded, dropped, "Bus reset");
        self.apply(changes);
        self.monitor.emit(MonitorEvent::Reset);
    }

    /// Subscribe to the monitor feed.
    #[must_use]
    pub fn monitor(&self) -> MonitorSubscription {
        self.monitor.subscribe()
    }

    /// Emit a monitor event on behalf of a collaborator.
    pub fn report(&self, event: MonitorEvent) {
        self.monitor.emit(event);
    }

    /// Number of handler panics caught so far.
    #[must_use]
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    /// Register a lifecycle hook. The bus keeps only a weak reference.
    pub fn add_lifecycle_hook(&self, hook: Weak<dyn ChannelLifecycle>) {
        let mut hooks = self.hooks.write();
        hooks.retain(|h| h.strong_count() > 0);
        hooks.push(hook);
    }

    fn apply(&self, changes: Vec<Lifecycle>) {
        for change in changes {
            match change {
                Lifecycle::ChannelCreated(channel) => {
                    debug!(channel = %channel, "Channel created");
                    self.monitor.emit(MonitorEvent::ChannelCreated { channel });
                }
                Lifecycle::ChannelDestroyed { channel, galactic } => {
                    debug!(channel = %channel, galactic, "Channel destroyed");
                    if galactic {
                        self.each_hook(|hook| hook.galactic_released(&channel));
                        self.monitor.emit(MonitorEvent::GalacticUnbound {
                            channel: channel.clone(),
                        });
                    }
                    self.monitor.emit(MonitorEvent::ChannelDestroyed { channel });
                }
                Lifecycle::Subscribed { channel, id } => {
                    trace!(channel = %channel, subscription = %id, "Subscribed");
                    self.monitor.emit(MonitorEvent::Subscribed { channel, id });
                }
                Lifecycle::Unsubscribed { channel, id } => {
                    trace!(channel = %channel, subscription = %id, "Unsubscribed");
                    // A request whose listener is gone can never resolve.
                    self.correlator.discard_subscriptions(&[id]);
                    self.monitor.emit(MonitorEvent::Unsubscribed { channel, id });
                }
                Lifecycle::GalacticActivated(channel) => {
                    debug!(channel = %channel, "Galactic channel active");
                    self.each_hook(|hook| hook.galactic_activated(&channel));
                }
                Lifecycle::GalacticBound(channel) => {
                    debug!(channel = %channel, "Channel bound to fabric");
                    self.monitor.emit(MonitorEvent::GalacticBound { channel });
                }
            }
        }
    }

    fn each_hook<F>(&self, f: F)
    where
        F: Fn(&dyn ChannelLifecycle),
    {
        let hooks: Vec<Arc<dyn ChannelLifecycle>> =
            self.hooks.read().iter().filter_map(Weak::upgrade).collect();
        for hook in hooks {
            f(hook.as_ref());
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.config.name)
            .field("channels", &self.registry.lock().channel_names().len())
            .field("pending", &self.correlator.len())
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
