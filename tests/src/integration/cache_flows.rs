//! # Cache Flows
//!
//! Two components share one bus: a service owning a `BusCache` and a view
//! that only watches the change channel through its own cache handle.

#[cfg(test)]
mod tests {
    use bifrost_bus::EventBus;
    use bifrost_cache::{BusCache, CacheItem, MutateStream, MutationRequest};
    use bifrost_types::{codes, ApiError};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    #[derive(Debug, Clone, PartialEq)]
    struct Account {
        owner: String,
        balance: i64,
    }

    impl CacheItem for Account {
        fn type_tag(&self) -> &str {
            "account"
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Change {
        Created,
        Updated,
        Closed,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Command {
        Deposit,
        Freeze,
    }

    type Accounts = BusCache<Account, Change, Command>;
    type Deposits = Arc<MutateStream<Account, Command>>;

    fn account(owner: &str, balance: i64) -> Account {
        Account {
            owner: owner.to_string(),
            balance,
        }
    }

    /// Service side: owns the data and answers deposits by adding 10.
    fn bank(bus: &Arc<EventBus>) -> (Arc<Accounts>, Deposits) {
        let accounts = Arc::new(Accounts::new(Arc::clone(bus), "accounts"));
        let deposits = Arc::new(accounts.on_mutation_request("account", &[Command::Deposit]));
        let responder = Arc::downgrade(&deposits);
        let store = Arc::downgrade(&accounts);
        deposits
            .subscribe(move |request: &MutationRequest<Account, Command>| {
                let (Some(stream), Some(store)) = (responder.upgrade(), store.upgrade()) else {
                    return;
                };
                if request.value.balance < 0 {
                    stream.error(request, ApiError::new(codes::MUTATION_FAILED, "overdrawn"));
                    return;
                }
                let updated = Account {
                    balance: request.value.balance + 10,
                    ..request.value.clone()
                };
                stream.success(request, updated);
            })
            .unwrap();
        (accounts, deposits)
    }

    // =============================================================================
    // CHANGE STREAMS
    // =============================================================================

    #[test]
    fn test_u1_created_ticks_once_updated_never() {
        let bus = EventBus::with_defaults();
        let (service, _deposits) = bank(&bus);
        let view = Accounts::new(Arc::clone(&bus), "accounts");
        let u1 = Uuid::new_v4();

        let created = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&created);
        view.on_change(u1, &[Change::Created])
            .subscribe(move |c| sink.lock().push(c.value.clone()))
            .unwrap();
        let updated = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&updated);
        view.on_change(u1, &[Change::Updated])
            .subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        service.encache(u1, account("ada", 1), Change::Created);

        assert_eq!(*created.lock(), vec![account("ada", 1)]);
        assert_eq!(updated.load(Ordering::SeqCst), 0);
        // The view saw the change but holds no data of its own.
        assert!(view.retrieve(&u1).is_none());
        assert_eq!(service.retrieve(&u1), Some(account("ada", 1)));
    }

    #[test]
    fn test_type_stream_counts_every_matching_change() {
        let bus = EventBus::with_defaults();
        let (service, _deposits) = bank(&bus);
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        service
            .on_all_changes("account", &[Change::Created, Change::Closed])
            .subscribe(move |c| sink.lock().push(c.state))
            .unwrap();

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        service.encache(a, account("a", 0), Change::Created);
        service.encache(b, account("b", 0), Change::Created);
        service.encache(a, account("a", 5), Change::Updated);
        assert!(service.remove(&b, Change::Closed));
        assert!(!service.remove(&b, Change::Closed));

        assert_eq!(
            *changes.lock(),
            vec![Change::Created, Change::Created, Change::Closed]
        );
        assert_eq!(service.all_values(), vec![account("a", 5)]);
    }

    // =============================================================================
    // MUTATION PROTOCOL
    // =============================================================================

    #[test]
    fn test_mutate_invokes_exactly_one_handler() {
        let bus = EventBus::with_defaults();
        let (service, _deposits) = bank(&bus);
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        for balance in [5, -1] {
            let (ok, err) = (Arc::clone(&outcomes), Arc::clone(&outcomes));
            assert!(service.mutate(
                account("ada", balance),
                Command::Deposit,
                move |a| ok.lock().push(Ok(a.balance)),
                move |e| err.lock().push(Err(e.code)),
            ));
        }

        assert_eq!(
            *outcomes.lock(),
            vec![Ok(15), Err(codes::MUTATION_FAILED)]
        );
    }

    #[test]
    fn test_mutate_without_matching_handler_is_false() {
        let bus = EventBus::with_defaults();
        let (service, _deposits) = bank(&bus);
        let calls = Arc::new(AtomicUsize::new(0));
        let (ok, err) = (Arc::clone(&calls), Arc::clone(&calls));

        let accepted = service.mutate(
            account("ada", 1),
            Command::Freeze,
            move |_| {
                ok.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                err.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert!(!accepted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(bus.pending_count(), 0);
    }

    // =============================================================================
    // READINESS AND BULK LOAD
    // =============================================================================

    #[test]
    fn test_when_ready_fires_once_either_side_of_initialized() {
        let bus = EventBus::with_defaults();
        let (service, _deposits) = bank(&bus);
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&before);
        service.when_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(before.load(Ordering::SeqCst), 0);

        assert!(service.populate(vec![(Uuid::new_v4(), account("ada", 1))]));
        service.initialized();
        assert_eq!(before.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&after);
        service.when_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(before.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_populate_second_call_is_noop() {
        let bus = EventBus::with_defaults();
        let (service, _deposits) = bank(&bus);
        let first = vec![(Uuid::new_v4(), account("a", 1)), (Uuid::new_v4(), account("b", 2))];

        assert!(service.populate(first.clone()));
        assert!(!service.populate(vec![(Uuid::new_v4(), account("c", 3))]));

        let mut values = service.all_values();
        values.sort_by(|x, y| x.owner.cmp(&y.owner));
        assert_eq!(values, vec![account("a", 1), account("b", 2)]);
    }

    proptest! {
        #[test]
        fn prop_encache_then_retrieve(entries in prop::collection::vec(("[a-z]{1,8}", any::<i64>()), 1..20)) {
            let bus = EventBus::with_defaults();
            let (service, _deposits) = bank(&bus);
            for (owner, balance) in entries {
                let id = Uuid::new_v4();
                let value = account(&owner, balance);
                service.encache(id, value.clone(), Change::Created);
                prop_assert_eq!(service.retrieve(&id), Some(value));
            }
        }
    }
}
