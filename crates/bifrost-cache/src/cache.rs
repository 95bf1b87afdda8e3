//! # BusCache
//!
//! Keyed in-memory store whose every change is broadcast on the bus.
//!
//! Each cache owns three channels, all derived from its name:
//!
//! - `bifrost.cache.<name>.changes`: one `Data` envelope per encache/remove
//! - `bifrost.cache.<name>.mutations`: mutation requests and their replies
//! - `bifrost.cache.<name>.ready`: fires once when the cache is initialized

use crate::model::{CacheChange, CacheEntry, CacheItem, MutationMatcher, MutationRequest, Tag};
use crate::stream::{CacheStream, ChangeSelector, MutateStream};
use bifrost_bus::{EventBus, RequestOptions, SubscribeOptions};
use bifrost_types::{codes, ApiError, ApiResponse, CorrelationId, Envelope, MessageKind};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Readiness marker published on the ready channel.
#[derive(Debug, Clone, Copy)]
struct Ready;

pub struct BusCache<T, S, M = S> {
    bus: Arc<EventBus>,
    name: String,
    changes: String,
    mutations: String,
    ready_channel: String,
    entries: RwLock<HashMap<Uuid, CacheEntry<T, S>>>,
    ready: Mutex<bool>,
    mutation_timeout: Option<Duration>,
    _mutation: PhantomData<fn() -> M>,
}

impl<T, S, M> BusCache<T, S, M>
where
    T: CacheItem,
    S: Tag,
    M: Tag,
{
    pub fn new(bus: Arc<EventBus>, name: &str) -> Self {
        let prefix = format!("bifrost.cache.{}", name);
        Self {
            bus,
            name: name.to_string(),
            changes: format!("{}.changes", prefix),
            mutations: format!("{}.mutations", prefix),
            ready_channel: format!("{}.ready", prefix),
            entries: RwLock::new(HashMap::new()),
            ready: Mutex::new(false),
            mutation_timeout: None,
            _mutation: PhantomData,
        }
    }

    /// Override the bus request timeout for `mutate`.
    #[must_use]
    pub fn with_mutation_timeout(mut self, timeout: Duration) -> Self {
        self.mutation_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn change_channel(&self) -> &str {
        &self.changes
    }

    #[must_use]
    pub fn mutation_channel(&self) -> &str {
        &self.mutations
    }

    // =========================================================================
    // ENTRIES
    // =========================================================================

    /// Insert or replace `id`, then broadcast the change.
    pub fn encache(&self, id: Uuid, value: T, state: S) {
        self.entries.write().insert(
            id,
            CacheEntry {
                id,
                value: value.clone(),
                state: Some(state.clone()),
            },
        );
        trace!(cache = %self.name, %id, state = ?state, "Encached");
        self.broadcast(CacheChange { id, value, state });
    }

    #[must_use]
    pub fn retrieve(&self, id: &Uuid) -> Option<T> {
        self.entries.read().get(id).map(|e| e.value.clone())
    }

    /// The stored entry, including the state of its last change.
    #[must_use]
    pub fn entry(&self, id: &Uuid) -> Option<CacheEntry<T, S>> {
        self.entries.read().get(id).cloned()
    }

    #[must_use]
    pub fn all_values(&self) -> Vec<T> {
        self.entries.read().values().map(|e| e.value.clone()).collect()
    }

    #[must_use]
    pub fn all_values_as_map(&self) -> HashMap<Uuid, T> {
        self.entries
            .read()
            .iter()
            .map(|(id, e)| (*id, e.value.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Delete `id`. The change carries the removed value. Nothing is
    /// broadcast when `id` was absent.
    pub fn remove(&self, id: &Uuid, state: S) -> bool {
        let Some(removed) = self.entries.write().remove(id) else {
            return false;
        };
        trace!(cache = %self.name, %id, state = ?state, "Removed");
        self.broadcast(CacheChange {
            id: *id,
            value: removed.value,
            state,
        });
        true
    }

    /// Bulk-load into an empty cache and mark it ready.
    ///
    /// Returns false and changes nothing if the cache already holds data.
    /// No change envelopes are published.
    pub fn populate<I>(&self, items: I) -> bool
    where
        I: IntoIterator<Item = (Uuid, T)>,
    {
        {
            let mut entries = self.entries.write();
            if !entries.is_empty() {
                debug!(cache = %self.name, "Populate skipped, cache not empty");
                return false;
            }
            entries.extend(items.into_iter().map(|(id, value)| {
                (
                    id,
                    CacheEntry {
                        id,
                        value,
                        state: None,
                    },
                )
            }));
            info!(cache = %self.name, entries = entries.len(), "Cache populated");
        }
        self.initialized();
        true
    }

    /// Drop every entry and the ready flag. Subscribers see nothing.
    pub fn reset(&self) {
        self.entries.write().clear();
        *self.ready.lock() = false;
        info!(cache = %self.name, "Cache reset");
    }

    fn broadcast(&self, change: CacheChange<T, S>) {
        if self.bus.subscriber_count(&self.changes) == 0 {
            return;
        }
        self.bus
            .publish(Envelope::new(&self.changes, MessageKind::Data, change));
    }

    // =========================================================================
    // STREAMS
    // =========================================================================

    /// Changes to `id` whose state is in `states` (empty: any state).
    #[must_use]
    pub fn on_change(&self, id: Uuid, states: &[S]) -> CacheStream<T, S> {
        CacheStream::new(
            Arc::clone(&self.bus),
            &self.changes,
            ChangeSelector::Id(id),
            states,
        )
    }

    /// Changes to any object tagged `type_tag`.
    #[must_use]
    pub fn on_all_changes(&self, type_tag: &str, states: &[S]) -> CacheStream<T, S> {
        CacheStream::new(
            Arc::clone(&self.bus),
            &self.changes,
            ChangeSelector::TypeTag(type_tag.to_string()),
            states,
        )
    }

    /// Mutation requests for `type_tag` whose type is in `mutation_types`
    /// (empty: any type).
    #[must_use]
    pub fn on_mutation_request(&self, type_tag: &str, mutation_types: &[M]) -> MutateStream<T, M> {
        MutateStream::new(
            Arc::clone(&self.bus),
            &self.mutations,
            MutationMatcher {
                type_tag: type_tag.to_string(),
                mutation_types: mutation_types.to_vec(),
            },
        )
    }

    // =========================================================================
    // MUTATION
    // =========================================================================

    /// Ask a registered mutation handler to change `value`.
    ///
    /// Returns false without invoking either callback when no handler
    /// accepts this type tag and mutation type. Otherwise exactly one of
    /// `on_success` and `on_error` runs, the latter also on timeout.
    ///
    /// Handlers registered through any cache of the same name on this bus
    /// count, since they share the mutation channel.
    pub fn mutate<F, E>(&self, value: T, mutation_type: M, on_success: F, on_error: E) -> bool
    where
        F: FnOnce(T) + Send + 'static,
        E: FnOnce(ApiError) + Send + 'static,
    {
        let id = CorrelationId::new();
        let type_tag = value.type_tag().to_string();
        debug!(cache = %self.name, type_tag = %type_tag, mutation = ?mutation_type, "Mutation requested");
        let request = MutationRequest {
            id,
            value,
            mutation_type,
            type_tag,
        };
        let envelope = Envelope::new(&self.mutations, MessageKind::Request, request)
            .with_correlation_id(id);
        if !self.bus.has_receiver(&envelope) {
            debug!(cache = %self.name, "No mutation handler");
            return false;
        }

        let mut options = RequestOptions::default();
        if let Some(timeout) = self.mutation_timeout {
            options = options.timeout(timeout);
        }

        let sent = self.bus.expect_response(
            id,
            &self.mutations,
            options,
            Box::new(move |mut response: ApiResponse| {
                if let Some(error) = response.error.take() {
                    on_error(error);
                    return;
                }
                match response.payload::<T>() {
                    Some(value) => on_success(value.clone()),
                    None => on_error(ApiError::new(
                        codes::MUTATION_FAILED,
                        "mutation reply carried an unexpected payload",
                    )),
                }
            }),
        );
        match sent {
            Ok(()) => {
                self.bus.publish(envelope);
                true
            }
            Err(e) => {
                warn!(cache = %self.name, error = %e, "Mutation request rejected");
                false
            }
        }
    }


    // =========================================================================
    // READINESS
    // =========================================================================

    /// Run `handler` once the cache is initialized; immediately if it
    /// already is. Pending handlers fire in registration order.
    pub fn when_ready<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let ready = self.ready.lock();
        if *ready {
            drop(ready);
            handler();
            return;
        }
        let slot = Mutex::new(Some(handler));
        self.bus.subscribe(
            &self.ready_channel,
            move |_: &Envelope| {
                if let Some(handler) = slot.lock().take() {
                    handler();
                }
            },
            SubscribeOptions::once(),
        );
    }

    /// Mark the cache ready. Only the first call after construction or
    /// `reset` fires the pending `when_ready` handlers.
    pub fn initialized(&self) {
        {
            let mut ready = self.ready.lock();
            if *ready {
                return;
            }
            *ready = true;
        }
        info!(cache = %self.name, "Cache ready");
        if self.bus.subscriber_count(&self.ready_channel) > 0 {
            self.bus
                .publish(Envelope::new(&self.ready_channel, MessageKind::Data, Ready));
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.ready.lock()
    }
}

impl<T, S, M> std::fmt::Debug for BusCache<T, S, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusCache")
            .field("name", &self.name)
            .field("entries", &self.entries.read().len())
            .field("ready", &*self.ready.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bifrost_bus::BusConfig;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    struct Point {
        x: i64,
    }

    impl CacheItem for Point {
        fn type_tag(&self) -> &str {
            "point"
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Label(String);

    impl CacheItem for Label {
        fn type_tag(&self) -> &str {
            "label"
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum State {
        Created,
        Updated,
        Deleted,
    }

    type PointCache = BusCache<Point, State>;

    fn cache() -> PointCache {
        BusCache::new(EventBus::with_defaults(), "points")
    }

    fn count_into(counter: &Arc<AtomicUsize>) -> impl Fn(&CacheChange<Point, State>) + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_created_scenario_ticks_only_matching_state() {
        let cache = cache();
        let u1 = Uuid::new_v4();

        let created = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&created);
        cache
            .on_change(u1, &[State::Created])
            .subscribe(move |c| sink.lock().push(c.value.clone()))
            .unwrap();
        let updated = Arc::new(AtomicUsize::new(0));
        cache
            .on_change(u1, &[State::Updated])
            .subscribe(count_into(&updated))
            .unwrap();

        cache.encache(u1, Point { x: 1 }, State::Created);

        assert_eq!(*created.lock(), vec![Point { x: 1 }]);
        assert_eq!(updated.load(Ordering::SeqCst), 0);
        assert_eq!(cache.retrieve(&u1), Some(Point { x: 1 }));
        assert_eq!(cache.entry(&u1).unwrap().state, Some(State::Created));
    }

    #[test]
    fn test_on_change_exact_counts() {
        let cache = cache();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let any_a = Arc::new(AtomicUsize::new(0));
        let stream = cache.on_change(a, &[]);
        stream.subscribe(count_into(&any_a)).unwrap();

        cache.encache(a, Point { x: 1 }, State::Created);
        cache.encache(b, Point { x: 2 }, State::Created);
        cache.encache(a, Point { x: 3 }, State::Updated);
        assert!(cache.remove(&a, State::Deleted));
        assert_eq!(any_a.load(Ordering::SeqCst), 3);

        assert!(stream.unsubscribe());
        cache.encache(a, Point { x: 4 }, State::Created);
        assert_eq!(any_a.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_on_all_changes_filters_by_type_tag() {
        let bus = EventBus::with_defaults();
        let points: BusCache<Point, State> = BusCache::new(Arc::clone(&bus), "mixed");
        let labels: BusCache<Label, State> = BusCache::new(bus, "mixed");

        let seen = Arc::new(AtomicUsize::new(0));
        points
            .on_all_changes("point", &[State::Created])
            .subscribe(count_into(&seen))
            .unwrap();

        points.encache(Uuid::new_v4(), Point { x: 1 }, State::Created);
        points.encache(Uuid::new_v4(), Point { x: 2 }, State::Updated);
        labels.encache(Uuid::new_v4(), Label("l".into()), State::Created);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_true_once_then_false() {
        let cache = cache();
        let id = Uuid::new_v4();
        let deletions = Arc::new(AtomicUsize::new(0));
        cache
            .on_change(id, &[State::Deleted])
            .subscribe(count_into(&deletions))
            .unwrap();

        cache.encache(id, Point { x: 9 }, State::Created);
        assert!(cache.remove(&id, State::Deleted));
        assert!(!cache.remove(&id, State::Deleted));
        assert_eq!(cache.retrieve(&id), None);
        assert_eq!(deletions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_subscribes_once() {
        let cache = cache();
        let stream = cache.on_change(Uuid::new_v4(), &[]);
        assert!(!stream.unsubscribe());
        stream.subscribe(|_| {}).unwrap();
        assert!(matches!(
            stream.subscribe(|_| {}),
            Err(crate::CacheError::AlreadySubscribed { .. })
        ));
    }

    #[test]
    fn test_populate_twice_keeps_first_contents() {
        let cache = cache();
        let first = vec![(Uuid::new_v4(), Point { x: 1 }), (Uuid::new_v4(), Point { x: 2 })];
        let second = vec![(Uuid::new_v4(), Point { x: 3 })];

        assert!(cache.populate(first.clone()));
        assert!(!cache.populate(second));

        let expected: HashMap<Uuid, Point> = first.into_iter().collect();
        assert_eq!(cache.all_values_as_map(), expected);
        assert!(cache.is_ready());
    }

    #[test]
    fn test_populate_does_not_broadcast() {
        let cache = cache();
        let seen = Arc::new(AtomicUsize::new(0));
        cache
            .on_all_changes("point", &[])
            .subscribe(count_into(&seen))
            .unwrap();
        cache.populate(vec![(Uuid::new_v4(), Point { x: 1 })]);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_when_ready_before_and_after_initialized() {
        let cache = cache();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..2 {
            let sink = Arc::clone(&order);
            cache.when_ready(move || sink.lock().push(n));
        }
        assert!(order.lock().is_empty());

        cache.initialized();
        assert_eq!(*order.lock(), vec![0, 1]);

        cache.initialized();
        let sink = Arc::clone(&order);
        cache.when_ready(move || sink.lock().push(2));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_reset_clears_silently() {
        let cache = cache();
        let seen = Arc::new(AtomicUsize::new(0));
        cache
            .on_all_changes("point", &[])
            .subscribe(count_into(&seen))
            .unwrap();
        cache.encache(Uuid::new_v4(), Point { x: 1 }, State::Created);
        cache.initialized();

        cache.reset();
        assert!(cache.is_empty());
        assert!(!cache.is_ready());
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        cache.when_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(cache.populate(Vec::<(Uuid, Point)>::new()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mutate_without_handler_returns_false() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let (ok, err) = (Arc::clone(&calls), Arc::clone(&calls));
        let accepted = cache.mutate(
            Point { x: 1 },
            State::Updated,
            move |_| {
                ok.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                err.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(!accepted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mutate_success_runs_only_success() {
        let cache = Arc::new(cache());
        let mutator = Arc::new(cache.on_mutation_request("point", &[State::Updated]));
        let responder = Arc::downgrade(&mutator);
        mutator
            .subscribe(move |request| {
                if let Some(stream) = responder.upgrade() {
                    let doubled = Point { x: request.value.x * 2 };
                    stream.success(request, doubled);
                }
            })
            .unwrap();

        let outcome = Arc::new(Mutex::new(Vec::new()));
        let (ok, err) = (Arc::clone(&outcome), Arc::clone(&outcome));
        assert!(cache.mutate(
            Point { x: 21 },
            State::Updated,
            move |p| ok.lock().push(Ok(p)),
            move |e| err.lock().push(Err(e.code)),
        ));
        assert_eq!(*outcome.lock(), vec![Ok(Point { x: 42 })]);

        // Mutation type not accepted by the handler.
        assert!(!cache.mutate(Point { x: 1 }, State::Deleted, |_| {}, |_| {}));
    }

    #[test]
    fn test_mutate_error_runs_only_error() {
        let cache = cache();
        let mutator = Arc::new(cache.on_mutation_request("point", &[]));
        let responder = Arc::downgrade(&mutator);
        mutator
            .subscribe(move |request| {
                if let Some(stream) = responder.upgrade() {
                    stream.error(request, ApiError::new(codes::MUTATION_FAILED, "read only"));
                }
            })
            .unwrap();

        let outcome = Arc::new(Mutex::new(Vec::new()));
        let (ok, err) = (Arc::clone(&outcome), Arc::clone(&outcome));
        assert!(cache.mutate(
            Point { x: 1 },
            State::Created,
            move |p| ok.lock().push(Ok(p)),
            move |e| err.lock().push(Err(e.code)),
        ));
        assert_eq!(*outcome.lock(), vec![Err(codes::MUTATION_FAILED)]);
    }

    #[test]
    fn test_unsubscribed_mutator_no_longer_counts() {
        let cache = cache();
        let mutator = cache.on_mutation_request("point", &[]);
        mutator.subscribe(|_| {}).unwrap();
        assert!(mutator.unsubscribe());
        assert!(!cache.mutate(Point { x: 1 }, State::Created, |_| {}, |_| {}));
    }

    #[test]
    fn test_mutate_reaches_handler_of_same_named_cache() {
        let bus = EventBus::new(BusConfig::default());
        let service: PointCache = BusCache::new(Arc::clone(&bus), "shared");
        let client: PointCache = BusCache::new(Arc::clone(&bus), "shared");
        let mutator = Arc::new(service.on_mutation_request("point", &[]));
        let responder = Arc::downgrade(&mutator);
        mutator
            .subscribe(move |request| {
                if let Some(stream) = responder.upgrade() {
                    stream.success(request, Point { x: request.value.x + 1 });
                }
            })
            .unwrap();

        let outcome = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcome);
        assert!(client.mutate(
            Point { x: 1 },
            State::Updated,
            move |p| sink.lock().push(p),
            |_| {},
        ));
        assert_eq!(*outcome.lock(), vec![Point { x: 2 }]);

        let other: PointCache = BusCache::new(Arc::clone(&bus), "elsewhere");
        assert!(!other.mutate(Point { x: 1 }, State::Updated, |_| {}, |_| {}));
    }

    #[test]
    fn test_unanswered_mutation_times_out_to_error() {
        let bus = EventBus::new(BusConfig::default());
        let cache: PointCache =
            BusCache::new(Arc::clone(&bus), "slow").with_mutation_timeout(Duration::ZERO);
        let mutator = cache.on_mutation_request("point", &[]);
        mutator.subscribe(|_| {}).unwrap();

        let outcome = Arc::new(Mutex::new(Vec::new()));
        let (ok, err) = (Arc::clone(&outcome), Arc::clone(&outcome));
        assert!(cache.mutate(
            Point { x: 1 },
            State::Created,
            move |p| ok.lock().push(Ok(p)),
            move |e| err.lock().push(Err(e.code)),
        ));
        assert!(outcome.lock().is_empty());

        assert_eq!(bus.expire_overdue(), 1);
        assert_eq!(*outcome.lock(), vec![Err(codes::TIMEOUT)]);
    }

    proptest! {
        #[test]
        fn prop_retrieve_returns_last_encached(writes in prop::collection::vec((0u8..8, any::<i64>()), 1..40)) {
            let cache = cache();
            let ids: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();
            let mut expected = HashMap::new();
            for (slot, x) in writes {
                let id = ids[slot as usize];
                cache.encache(id, Point { x }, State::Updated);
                expected.insert(id, Point { x });
            }
            for (id, value) in &expected {
                prop_assert_eq!(cache.retrieve(id), Some(value.clone()));
            }
            prop_assert_eq!(cache.len(), expected.len());
        }
    }
}
