//! Subscription handles over a cache's change and mutation channels.

use crate::error::CacheError;
use crate::model::{CacheChange, CacheItem, MutationMatcher, MutationRequest, Tag};
use bifrost_bus::{EventBus, ListenerHandle, SubscribeOptions, SubscriptionId};
use bifrost_types::{ApiError, Envelope, MessageKind};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Which changes a [`CacheStream`] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSelector {
    /// One cached object.
    Id(Uuid),
    /// Every object carrying this type tag.
    TypeTag(String),
}

impl ChangeSelector {
    fn matches<T: CacheItem, S>(&self, change: &CacheChange<T, S>) -> bool {
        match self {
            ChangeSelector::Id(id) => change.id == *id,
            ChangeSelector::TypeTag(tag) => change.value.type_tag() == tag,
        }
    }
}

/// Change notifications for one id or one type tag, narrowed by state.
pub struct CacheStream<T, S> {
    bus: Arc<EventBus>,
    channel: String,
    selector: ChangeSelector,
    states: Vec<S>,
    listener: Mutex<Option<ListenerHandle>>,
    _item: PhantomData<fn() -> T>,
}

impl<T, S> CacheStream<T, S>
where
    T: CacheItem,
    S: Tag,
{
    pub(crate) fn new(bus: Arc<EventBus>, channel: &str, selector: ChangeSelector, states: &[S]) -> Self {
        Self {
            bus,
            channel: channel.to_string(),
            selector,
            states: states.to_vec(),
            listener: Mutex::new(None),
            _item: PhantomData,
        }
    }

    /// Start receiving matching changes. A stream subscribes once.
    pub fn subscribe<F>(&self, handler: F) -> Result<SubscriptionId, CacheError>
    where
        F: Fn(&CacheChange<T, S>) + Send + Sync + 'static,
    {
        let mut slot = self.listener.lock();
        if slot.is_some() {
            return Err(CacheError::AlreadySubscribed {
                channel: self.channel.clone(),
            });
        }

        let selector = self.selector.clone();
        let states = self.states.clone();
        let options = SubscribeOptions::default().filter(move |e: &Envelope| {
            e.payload::<CacheChange<T, S>>()
                .is_some_and(|change| selector.matches(change) && change.state_in(&states))
        });
        let listener = self.bus.subscribe(
            &self.channel,
            move |e: &Envelope| {
                if let Some(change) = e.payload::<CacheChange<T, S>>() {
                    handler(change);
                }
            },
            options,
        );
        let id = listener.id();
        debug!(channel = %self.channel, selector = ?self.selector, "Cache stream subscribed");
        *slot = Some(listener);
        Ok(id)
    }

    /// Stop receiving changes. False if never subscribed or already closed.
    pub fn unsubscribe(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(ListenerHandle::close)
    }

    #[must_use]
    pub fn selector(&self) -> &ChangeSelector {
        &self.selector
    }
}

impl<T, S: std::fmt::Debug> std::fmt::Debug for CacheStream<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStream")
            .field("channel", &self.channel)
            .field("selector", &self.selector)
            .field("states", &self.states)
            .finish()
    }
}

/// Service-side view of mutation requests for one type tag.
///
/// The handler passed to [`MutateStream::subscribe`] answers each request
/// exactly once through [`MutateStream::success`] or [`MutateStream::error`].
pub struct MutateStream<T, M> {
    bus: Arc<EventBus>,
    channel: String,
    matcher: MutationMatcher<M>,
    listener: Mutex<Option<ListenerHandle>>,
    _item: PhantomData<fn() -> T>,
}

impl<T, M> MutateStream<T, M>
where
    T: CacheItem,
    M: Tag,
{
    pub(crate) fn new(
        bus: Arc<EventBus>,
        channel: &str,
        matcher: MutationMatcher<M>,
    ) -> Self {
        Self {
            bus,
            channel: channel.to_string(),
            matcher,
            listener: Mutex::new(None),
            _item: PhantomData,
        }
    }

    /// Register `handler` for matching mutation requests.
    pub fn subscribe<F>(&self, handler: F) -> Result<SubscriptionId, CacheError>
    where
        F: Fn(&MutationRequest<T, M>) + Send + Sync + 'static,
    {
        let mut slot = self.listener.lock();
        if slot.is_some() {
            return Err(CacheError::AlreadySubscribed {
                channel: self.channel.clone(),
            });
        }

        let matcher = self.matcher.clone();
        let options = SubscribeOptions::default().filter(move |e: &Envelope| {
            e.kind == MessageKind::Request
                && e.payload::<MutationRequest<T, M>>()
                    .is_some_and(|r| matcher.matches(&r.type_tag, &r.mutation_type))
        });
        let listener = self.bus.subscribe(
            &self.channel,
            move |e: &Envelope| {
                if let Some(request) = e.payload::<MutationRequest<T, M>>() {
                    handler(request);
                }
            },
            options,
        );
        let id = listener.id();
        debug!(
            channel = %self.channel,
            type_tag = %self.matcher.type_tag,
            "Mutation handler registered"
        );
        *slot = Some(listener);
        Ok(id)
    }

    /// Answer `request` with the mutated value.
    pub fn success(&self, request: &MutationRequest<T, M>, value: T) {
        self.bus.send_response(&self.channel, value, Some(request.id));
    }

    /// Reject `request`.
    pub fn error(&self, request: &MutationRequest<T, M>, error: ApiError) {
        self.bus.send_error(&self.channel, error, Some(request.id));
    }

    pub fn unsubscribe(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(ListenerHandle::close)
    }
}

impl<T, M: std::fmt::Debug> std::fmt::Debug for MutateStream<T, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutateStream")
            .field("channel", &self.channel)
            .field("matcher", &self.matcher)
            .finish()
    }
}
