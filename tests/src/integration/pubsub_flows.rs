//! # Pub/Sub Flows
//!
//! Dispatch ordering, handler isolation and request correlation on a
//! single bus, including publishers on several OS threads.

#[cfg(test)]
mod tests {
    use bifrost_bus::{EventBus, MonitorEvent, RequestOptions, SubscribeOptions};
    use bifrost_types::{codes, ApiResponse, Envelope, MessageKind};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    // =============================================================================
    // ORDERING
    // =============================================================================

    #[test]
    fn test_nested_publishes_keep_per_channel_fifo() {
        let bus = EventBus::with_defaults();
        let log = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&bus);
        let sink = Arc::clone(&log);
        bus.listen("orders", move |e| {
            let n = *e.payload::<u32>().unwrap_or(&0);
            sink.lock().push(format!("orders:{}", n));
            if let Some(bus) = weak.upgrade() {
                bus.send("audit", n);
            }
        });
        let sink = Arc::clone(&log);
        bus.listen("audit", move |e| {
            sink.lock().push(format!("audit:{}", e.payload::<u32>().unwrap_or(&0)));
        });

        bus.send("orders", 1u32);
        bus.send("orders", 2u32);

        assert_eq!(
            *log.lock(),
            vec!["orders:1", "audit:1", "orders:2", "audit:2"]
        );
    }

    #[test]
    fn test_publishers_on_many_threads_lose_nothing() {
        let bus = EventBus::with_defaults();
        let seen = Arc::new(Mutex::new(HashMap::<usize, Vec<u32>>::new()));
        let sink = Arc::clone(&seen);
        bus.listen("stream", move |e| {
            if let Some((thread, n)) = e.payload::<(usize, u32)>() {
                sink.lock().entry(*thread).or_default().push(*n);
            }
        });

        thread::scope(|scope| {
            for t in 0..4usize {
                let bus = Arc::clone(&bus);
                scope.spawn(move || {
                    for n in 0..250u32 {
                        bus.send("stream", (t, n));
                    }
                });
            }
        });

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        for values in seen.values() {
            // Each publisher's own envelopes arrive in publish order.
            assert_eq!(*values, (0..250).collect::<Vec<_>>());
        }
    }

    // =============================================================================
    // ISOLATION
    // =============================================================================

    #[test]
    fn test_panicking_handler_reported_and_siblings_served() {
        let bus = EventBus::with_defaults();
        let mut monitor = bus.monitor();
        let delivered = Arc::new(Mutex::new(0));

        bus.listen("c", |_| panic!("broken consumer"));
        let sink = Arc::clone(&delivered);
        bus.listen("c", move |_| *sink.lock() += 1);

        bus.send("c", ());
        bus.send("c", ());

        assert_eq!(*delivered.lock(), 2);
        assert_eq!(bus.handler_failures(), 2);
        let failures = monitor
            .drain()
            .into_iter()
            .filter(|e| matches!(e, MonitorEvent::HandlerFailed { .. }))
            .count();
        assert_eq!(failures, 2);
    }

    #[test]
    fn test_monitor_follows_channel_lifecycle() {
        let bus = EventBus::with_defaults();
        let mut monitor = bus.monitor();

        let listener = bus.subscribe("life", |_| {}, SubscribeOptions::default());
        bus.publish(Envelope::new("nobody", MessageKind::Data, ()));
        listener.close();

        let events = monitor.drain();
        let id = listener.id();
        assert_eq!(
            events,
            vec![
                MonitorEvent::ChannelCreated { channel: "life".into() },
                MonitorEvent::Subscribed { channel: "life".into(), id },
                MonitorEvent::Dropped { channel: "nobody".into(), kind: MessageKind::Data },
                MonitorEvent::Unsubscribed { channel: "life".into(), id },
                MonitorEvent::ChannelDestroyed { channel: "life".into() },
            ]
        );
    }

    // =============================================================================
    // CORRELATION
    // =============================================================================

    #[test]
    fn test_concurrent_requests_each_get_their_own_answer() {
        let bus = EventBus::with_defaults();
        bus.respond_stream("square", |req| {
            let n = *req.payload::<u64>().unwrap_or(&0);
            n * n
        })
        .unwrap();

        let answers = Arc::new(Mutex::new(HashMap::new()));
        thread::scope(|scope| {
            for t in 0..4u64 {
                let bus = Arc::clone(&bus);
                let answers = Arc::clone(&answers);
                scope.spawn(move || {
                    for i in 0..50u64 {
                        let n = t * 100 + i;
                        let sink = Arc::clone(&answers);
                        bus.request("square", n, RequestOptions::default(), move |r: ApiResponse| {
                            let previous = sink.lock().insert(n, r.payload::<u64>().copied());
                            assert!(previous.is_none(), "second answer for {}", n);
                        })
                        .unwrap();
                    }
                });
            }
        });

        let answers = answers.lock();
        assert_eq!(answers.len(), 200);
        for (n, square) in answers.iter() {
            assert_eq!(*square, Some(n * n));
        }
        assert_eq!(bus.pending_count(), 0);
    }

    #[test]
    fn test_timeout_and_late_reply_yield_single_callback() {
        let bus = EventBus::with_defaults();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let id = bus
            .request(
                "slow",
                (),
                RequestOptions::default().timeout(Duration::ZERO),
                move |r| sink.lock().push(r.error.map(|e| e.code)),
            )
            .unwrap();

        assert_eq!(bus.expire_overdue(), 1);
        bus.send_response("slow", (), Some(id));

        assert_eq!(*calls.lock(), vec![Some(codes::TIMEOUT)]);
    }
}
