//! # Channel Registry
//!
//! Owns every channel record and every subscription.
//!
//! Subscriptions live in an arena keyed by [`SubscriptionId`]. A channel
//! holds the ids of its subscribers in registration order; a subscription
//! holds its channel's name. Neither points at the other.
//!
//! The registry is plain data. The bus wraps it in a mutex and never calls
//! a handler while holding that mutex; instead every mutation returns the
//! [`Lifecycle`] changes it caused so the caller can act on them after the
//! lock is released.
//!
//! A listen-once subscription leaves the arena before its handler runs, but
//! its channel stays alive until the delivery finishes. A handler that
//! re-subscribes therefore lands on the same channel record, galactic
//! binding included.

use bifrost_types::Envelope;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Handler invoked for each delivered envelope.
pub type HandlerFn = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Predicate deciding whether a subscription wants an envelope.
pub type EnvelopeFilter = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Opaque handle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Options accepted by `subscribe`.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Close after the first accepted envelope.
    pub once: bool,
    /// Consumer that owns the subscription; used by `close(channel, consumer)`.
    pub consumer: Option<String>,
    /// Envelopes rejected by the filter are skipped and do not consume a
    /// listen-once subscription.
    pub filter: Option<EnvelopeFilter>,
}

impl SubscribeOptions {
    pub fn once() -> Self {
        Self {
            once: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    #[must_use]
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("once", &self.once)
            .field("consumer", &self.consumer)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// A change in channel or subscription lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    ChannelCreated(String),
    ChannelDestroyed { channel: String, galactic: bool },
    Subscribed { channel: String, id: SubscriptionId },
    Unsubscribed { channel: String, id: SubscriptionId },
    /// First reference taken on a galactic channel.
    GalacticActivated(String),
    GalacticBound(String),
}

struct SubscriptionRecord {
    channel: String,
    handler: HandlerFn,
    once: bool,
    consumer: Option<String>,
    filter: Option<EnvelopeFilter>,
}

struct Channel {
    subscribers: Vec<SubscriptionId>,
    galactic: bool,
    /// A galactic channel whose remote side has been asked for.
    activated: bool,
    ref_count: usize,
    /// Deliveries of consumed listen-once subscriptions still running.
    holds: usize,
    generation: u64,
}

impl Channel {
    fn new(generation: u64) -> Self {
        Self {
            subscribers: Vec::new(),
            galactic: false,
            activated: false,
            ref_count: 0,
            holds: 0,
            generation,
        }
    }

    fn is_unreferenced(&self) -> bool {
        self.ref_count == 0 && self.holds == 0
    }
}

/// Keeps a channel alive while a consumed listen-once handler runs.
///
/// Hand it back through [`ChannelRegistry::finish_delivery`].
#[derive(Debug)]
#[must_use]
pub(crate) struct ChannelHold {
    channel: String,
    generation: u64,
}

/// A subscriber resolved for one delivery.
pub(crate) struct Delivery {
    pub(crate) handler: HandlerFn,
    pub(crate) changes: Vec<Lifecycle>,
    pub(crate) hold: Option<ChannelHold>,
}

/// Snapshot of one channel, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub galactic: bool,
    pub ref_count: usize,
}

#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: HashMap<String, Channel>,
    subscriptions: HashMap<SubscriptionId, SubscriptionRecord>,
    next_id: u64,
    next_generation: u64,
}

impl ChannelRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create the channel if absent. Returns the lifecycle changes.
    pub(crate) fn open(&mut self, name: &str) -> Vec<Lifecycle> {
        let mut changes = Vec::new();
        self.ensure_channel(name, &mut changes);
        changes
    }

    pub(crate) fn subscribe(
        &mut self,
        name: &str,
        handler: HandlerFn,
        options: SubscribeOptions,
    ) -> (SubscriptionId, Vec<Lifecycle>) {
        let mut changes = Vec::new();
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);

        self.ensure_channel(name, &mut changes);
        if let Some(channel) = self.channels.get_mut(name) {
            channel.subscribers.push(id);
            channel.ref_count += 1;
            if channel.galactic && !channel.activated {
                channel.activated = true;
                changes.push(Lifecycle::GalacticActivated(name.to_string()));
            }
        }

        self.subscriptions.insert(
            id,
            SubscriptionRecord {
                channel: name.to_string(),
                handler,
                once: options.once,
                consumer: options.consumer,
                filter: options.filter,
            },
        );
        changes.push(Lifecycle::Subscribed {
            channel: name.to_string(),
            id,
        });
        (id, changes)
    }

    /// Remove one subscription, releasing its reference.
    ///
    /// Returns `None` if the id is unknown (already closed).
    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> Option<Vec<Lifecycle>> {
        let record = self.subscriptions.remove(&id)?;
        let mut changes = vec![Lifecycle::Unsubscribed {
            channel: record.channel.clone(),
            id,
        }];
        self.release(&record.channel, id, &mut changes);
        Some(changes)
    }

    /// Remove a subscription without letting its channel go.
    fn consume(&mut self, id: SubscriptionId) -> Option<(ChannelHold, Vec<Lifecycle>)> {
        let record = self.subscriptions.remove(&id)?;
        let channel = self.channels.get_mut(&record.channel)?;
        channel.subscribers.retain(|s| *s != id);
        channel.ref_count = channel.ref_count.saturating_sub(1);
        channel.holds += 1;
        let hold = ChannelHold {
            channel: record.channel.clone(),
            generation: channel.generation,
        };
        let changes = vec![Lifecycle::Unsubscribed {
            channel: record.channel,
            id,
        }];
        Some((hold, changes))
    }

    /// Release the hold taken for a listen-once delivery.
    ///
    /// The channel is torn down if nothing re-subscribed meanwhile. A hold
    /// on a channel that was reset and recreated during the delivery is
    /// ignored.
    pub(crate) fn finish_delivery(&mut self, hold: ChannelHold) -> Vec<Lifecycle> {
        let mut changes = Vec::new();
        let Some(channel) = self.channels.get_mut(&hold.channel) else {
            return changes;
        };
        if channel.generation != hold.generation {
            return changes;
        }
        channel.holds = channel.holds.saturating_sub(1);
        if channel.is_unreferenced() {
            self.destroy(&hold.channel, &mut changes);
        }
        changes
    }

    /// Release every subscription `consumer` holds on `name`.
    ///
    /// A channel that ends up (or already was) without references is torn
    /// down. Returns the released subscription ids.
    pub(crate) fn release_consumer(
        &mut self,
        name: &str,
        consumer: &str,
    ) -> (Vec<SubscriptionId>, Vec<Lifecycle>) {
        let mut changes = Vec::new();
        let owned: Vec<SubscriptionId> = match self.channels.get(name) {
            Some(channel) => channel
                .subscribers
                .iter()
                .copied()
                .filter(|id| {
                    self.subscriptions
                        .get(id)
                        .is_some_and(|s| s.consumer.as_deref() == Some(consumer))
                })
                .collect(),
            None => return (Vec::new(), changes),
        };

        for id in &owned {
            if let Some(more) = self.unsubscribe(*id) {
                changes.extend(more);
            }
        }

        if self.channels.get(name).is_some_and(Channel::is_unreferenced) {
            self.destroy(name, &mut changes);
        }
        (owned, changes)
    }

    /// Subscriber ids of `name` in registration order.
    pub(crate) fn subscribers(&self, name: &str) -> Vec<SubscriptionId> {
        self.channels
            .get(name)
            .map(|c| c.subscribers.clone())
            .unwrap_or_default()
    }

    /// Resolve a subscriber for delivery of `envelope`.
    ///
    /// Returns `None` when the subscription has been closed or its filter
    /// rejects the envelope. A listen-once subscription is removed here,
    /// before its handler can run, and the delivery carries a hold on its
    /// channel.
    pub(crate) fn take_for_delivery(
        &mut self,
        id: SubscriptionId,
        envelope: &Envelope,
    ) -> Option<Delivery> {
        let record = self.subscriptions.get(&id)?;
        if let Some(filter) = &record.filter {
            if !filter(envelope) {
                return None;
            }
        }
        let handler = Arc::clone(&record.handler);
        if !record.once {
            return Some(Delivery {
                handler,
                changes: Vec::new(),
                hold: None,
            });
        }
        let (hold, changes) = self.consume(id)?;
        Some(Delivery {
            handler,
            changes,
            hold: Some(hold),
        })
    }

    /// Whether any active subscriber of the envelope's channel would take it.
    pub(crate) fn accepts(&self, envelope: &Envelope) -> bool {
        let Some(channel) = self.channels.get(&envelope.channel) else {
            return false;
        };
        channel.subscribers.iter().any(|id| {
            self.subscriptions
                .get(id)
                .is_some_and(|s| s.filter.as_ref().map_or(true, |f| f(envelope)))
        })
    }

    /// Mark a channel as bridged to the fabric, creating it if needed.
    pub(crate) fn bind_galactic(&mut self, name: &str) -> Vec<Lifecycle> {
        let mut changes = Vec::new();
        self.ensure_channel(name, &mut changes);
        if let Some(channel) = self.channels.get_mut(name) {
            if !channel.galactic {
                channel.galactic = true;
                changes.push(Lifecycle::GalacticBound(name.to_string()));
                if channel.ref_count > 0 {
                    channel.activated = true;
                    changes.push(Lifecycle::GalacticActivated(name.to_string()));
                }
            }
        }
        changes
    }

    /// Drop everything. Returns the teardown changes of every channel.
    pub(crate) fn clear(&mut self) -> Vec<Lifecycle> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        let mut changes = Vec::new();
        for name in names {
            self.destroy(&name, &mut changes);
        }
        self.subscriptions.clear();
        changes
    }

    pub(crate) fn is_active(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub(crate) fn info(&self, name: &str) -> Option<ChannelInfo> {
        self.channels.get(name).map(|c| ChannelInfo {
            name: name.to_string(),
            galactic: c.galactic,
            ref_count: c.ref_count,
        })
    }

    pub(crate) fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    fn ensure_channel(&mut self, name: &str, changes: &mut Vec<Lifecycle>) {
        if !self.channels.contains_key(name) {
            self.next_generation += 1;
            self.channels
                .insert(name.to_string(), Channel::new(self.next_generation));
            changes.push(Lifecycle::ChannelCreated(name.to_string()));
        }
    }

    fn release(&mut self, name: &str, id: SubscriptionId, changes: &mut Vec<Lifecycle>) {
        let Some(channel) = self.channels.get_mut(name) else {
            return;
        };
        channel.subscribers.retain(|s| *s != id);
        channel.ref_count = channel.ref_count.saturating_sub(1);
        if channel.is_unreferenced() {
            self.destroy(name, changes);
        }
    }

    fn destroy(&mut self, name: &str, changes: &mut Vec<Lifecycle>) {
        let Some(channel) = self.channels.remove(name) else {
            return;
        };
        for id in &channel.subscribers {
            if self.subscriptions.remove(id).is_some() {
                changes.push(Lifecycle::Unsubscribed {
                    channel: name.to_string(),
                    id: *id,
                });
            }
        }
        changes.push(Lifecycle::ChannelDestroyed {
            channel: name.to_string(),
            galactic: channel.galactic,
        });
    }
}
