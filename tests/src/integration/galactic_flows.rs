//! # Galactic Flows
//!
//! The bus extended over the loopback broker, with servbot answering jokes.
//!
//! ## Flows Tested
//!
//! 1. Request while disconnected fails fast
//! 2. Concurrent responses matched by correlation id, in any arrival order
//! 3. Remote subscription lifetime follows local listeners
//! 4. Transport failure and recovery
//! 5. Re-entrant requests and re-armed listeners keep the remote binding

#[cfg(test)]
mod tests {
    use bifrost_bus::{EventBus, MonitorEvent, SubscribeOptions};
    use bifrost_fabric::{
        BridgeConfig, BridgeError, ConnectionErrorKind, GalacticBridge, LoopbackBroker,
        LoopbackTransport,
    };
    use bifrost_node::servbot::{self, Joke, JOKE_COMMAND};
    use bifrost_types::{
        codes, ApiRequest, ApiResponse, ConnectionState, CorrelationId, FabricCommand,
        FabricFrame, MessageKind,
    };
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    struct Fabric {
        bus: Arc<EventBus>,
        broker: Arc<LoopbackBroker>,
        bridge: Arc<GalacticBridge>,
    }

    fn fabric(config: BridgeConfig) -> Fabric {
        let bus = EventBus::with_defaults();
        let broker = LoopbackBroker::new();
        servbot::install(&broker, "servbot");
        let transport = Arc::new(LoopbackTransport::new(Arc::clone(&broker)));
        let bridge = GalacticBridge::new(Arc::clone(&bus), transport, config);
        bridge.bind::<Joke>("servbot");
        Fabric { bus, broker, bridge }
    }

    fn responses() -> (
        Arc<Mutex<Vec<ApiResponse>>>,
        impl Fn() -> Box<dyn FnOnce(ApiResponse) + Send>,
    ) {
        let store = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::clone(&store);
        (store, move || {
            let sink = Arc::clone(&shared);
            Box::new(move |r: ApiResponse| sink.lock().push(r))
        })
    }

    fn remote_commands(broker: &LoopbackBroker, channel: &str, subscribe: bool) -> usize {
        broker.count_received(|c| match c {
            FabricCommand::Subscribe { channel: ch } => subscribe && ch == channel,
            FabricCommand::Unsubscribe { channel: ch } => !subscribe && ch == channel,
            FabricCommand::Message { .. } => false,
        })
    }

    // =============================================================================
    // SERVBOT
    // =============================================================================

    #[tokio::test]
    async fn test_servbot_request_while_disconnected_fails_fast() {
        let f = fabric(BridgeConfig::default());
        let (store, handler) = responses();

        let request = ApiRequest::new(JOKE_COMMAND, Value::Null).with_version(1);
        let result = f.bridge.request_galactic("servbot", request, handler());

        assert!(matches!(result, Err(BridgeError::NotConnected { .. })));
        assert!(store.lock().is_empty());
        assert_eq!(f.bus.pending_count(), 0);
        assert_eq!(f.broker.count_received(|_| true), 0);
    }

    #[tokio::test]
    async fn test_servbot_joke_over_event_loop() {
        let f = fabric(BridgeConfig::default());
        let _events = f.bridge.spawn_event_loop();
        f.bridge.connect().await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        f.bridge
            .request_galactic("servbot", ApiRequest::new(JOKE_COMMAND, ()), move |r| {
                let _ = tx.send(r);
            })
            .unwrap();

        let response = rx.await.unwrap();
        assert!(!response.is_error());
        assert!(response.payload::<Joke>().is_some());
    }

    #[tokio::test]
    async fn test_servbot_rejects_unknown_command() {
        let f = fabric(BridgeConfig::default());
        f.bridge.connect().await.unwrap();
        let (store, handler) = responses();

        f.bridge
            .request_galactic("servbot", ApiRequest::new("Weather", ()), handler())
            .unwrap();
        f.bridge.pump();

        let store = store.lock();
        assert_eq!(store.len(), 1);
        assert_eq!(store[0].error.as_ref().map(|e| e.code), Some(codes::NO_HANDLER));
    }

    // =============================================================================
    // CORRELATION
    // =============================================================================

    #[tokio::test]
    async fn test_responses_matched_by_id_in_reverse_arrival() {
        let f = fabric(BridgeConfig::default());
        f.bridge.connect().await.unwrap();

        let answers = Arc::new(Mutex::new(Vec::new()));
        let mut ids = Vec::new();
        for n in 0..5u64 {
            let sink = Arc::clone(&answers);
            let id = f
                .bridge
                .request_galactic("calc", ApiRequest::new("Echo", n), move |r: ApiResponse| {
                    let got = r.payload::<Value>().and_then(Value::as_u64);
                    sink.lock().push((n, got, r.id));
                })
                .unwrap();
            ids.push((id, n));
        }

        for (id, n) in ids.iter().rev() {
            let reply = FabricCommand::Message {
                frame: FabricFrame {
                    channel: "calc".into(),
                    kind: MessageKind::Response,
                    correlation_id: Some(*id),
                    version: Some(1),
                    payload: json!(n),
                },
            };
            f.broker.inject_raw(&reply.to_json().unwrap());
        }
        // A reply nobody asked for is ignored.
        let stray = FabricCommand::Message {
            frame: FabricFrame {
                channel: "calc".into(),
                kind: MessageKind::Response,
                correlation_id: Some(CorrelationId::new()),
                version: None,
                payload: json!(99),
            },
        };
        f.broker.inject_raw(&stray.to_json().unwrap());
        f.bridge.pump();

        let answers = answers.lock();
        assert_eq!(answers.len(), 5);
        for (n, got, _) in answers.iter() {
            assert_eq!(Some(*n), *got);
        }
        let order: Vec<u64> = answers.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(order, vec![4, 3, 2, 1, 0]);
        assert_eq!(f.bus.pending_count(), 0);
    }

    // =============================================================================
    // REMOTE SUBSCRIPTION LIFETIME
    // =============================================================================

    #[tokio::test]
    async fn test_only_last_close_unsubscribes_remotely() {
        let f = fabric(BridgeConfig::default());
        f.bridge.connect().await.unwrap();

        let handlers: Vec<_> = (0..3).map(|_| f.bridge.listen_galactic_stream("feed")).collect();
        for h in &handlers {
            h.handle(|_| {}).unwrap();
        }
        assert_eq!(remote_commands(&f.broker, "feed", true), 1);

        handlers[0].close();
        handlers[1].close();
        assert_eq!(remote_commands(&f.broker, "feed", false), 0);
        handlers[2].close();
        assert_eq!(remote_commands(&f.broker, "feed", false), 1);

        // A new lifetime subscribes again.
        let again = f.bridge.listen_galactic_stream("feed");
        again.handle(|_| {}).unwrap();
        assert_eq!(remote_commands(&f.broker, "feed", true), 2);
    }

    #[tokio::test]
    async fn test_consumer_close_releases_galactic_binding() {
        let f = fabric(BridgeConfig::default());
        f.bridge.connect().await.unwrap();

        let panel = f.bridge.listen_galactic_stream("prices").with_consumer("panel");
        panel.handle(|_| {}).unwrap();
        let other = f.bridge.listen_galactic_stream("prices").with_consumer("panel");
        other.handle(|_| {}).unwrap();

        assert_eq!(f.bus.close("prices", "panel"), 2);
        assert_eq!(remote_commands(&f.broker, "prices", false), 1);
        assert!(!f.bus.is_galactic("prices"));
    }

    #[tokio::test]
    async fn test_request_chained_from_response_handler() {
        let f = fabric(BridgeConfig::default());
        f.bridge.connect().await.unwrap();
        let (store, handler) = responses();

        let bridge = Arc::clone(&f.bridge);
        let first = Arc::clone(&store);
        f.bridge
            .request_galactic("servbot", ApiRequest::new(JOKE_COMMAND, ()), move |r| {
                first.lock().push(r);
                bridge
                    .request_galactic("servbot", ApiRequest::new(JOKE_COMMAND, ()), handler())
                    .unwrap();
            })
            .unwrap();

        f.bridge.pump();
        assert_eq!(f.bus.pending_count(), 1);
        f.bridge.pump();

        let store = store.lock();
        assert_eq!(store.len(), 2);
        assert!(store.iter().all(|r| r.payload::<Joke>().is_some()));
        assert_eq!(f.bus.pending_count(), 0);
        assert_eq!(remote_commands(&f.broker, "servbot", true), 1);
        assert_eq!(remote_commands(&f.broker, "servbot", false), 1);
    }

    fn arm_once(bus: &Arc<EventBus>, ticks: Arc<AtomicUsize>) {
        let weak = Arc::downgrade(bus);
        bus.subscribe(
            "news",
            move |_| {
                ticks.fetch_add(1, Ordering::SeqCst);
                if let Some(bus) = weak.upgrade() {
                    arm_once(&bus, Arc::clone(&ticks));
                }
            },
            SubscribeOptions::once(),
        );
    }

    #[tokio::test]
    async fn test_rearmed_listen_once_keeps_remote_subscription() {
        let f = fabric(BridgeConfig::default());
        f.bridge.connect().await.unwrap();
        f.bus.bind_galactic("news");
        let ticks = Arc::new(AtomicUsize::new(0));
        arm_once(&f.bus, Arc::clone(&ticks));

        for tick in 0..2 {
            assert_eq!(f.broker.publish("news", MessageKind::Data, json!(tick)), 1);
            f.bridge.pump();
        }

        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(f.bus.is_galactic("news"));
        assert_eq!(f.bus.subscriber_count("news"), 1);
        assert_eq!(remote_commands(&f.broker, "news", true), 1);
        assert_eq!(remote_commands(&f.broker, "news", false), 0);
    }

    // =============================================================================
    // FAILURE AND RECOVERY
    // =============================================================================

    #[tokio::test]
    async fn test_transport_failure_then_reconnect() {
        let f = fabric(BridgeConfig::default());
        let mut monitor = f.bus.monitor();
        f.bridge.connect().await.unwrap();

        let listener = f.bridge.listen_galactic_stream("feed");
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        listener.handle(move |_| *sink.lock() += 1).unwrap();

        let (store, handler) = responses();
        f.bridge
            .request_galactic("void", ApiRequest::new("Ping", ()), handler())
            .unwrap();

        f.broker.drop_connections("broker restart");
        f.bridge.pump();
        assert_eq!(f.bridge.state(), ConnectionState::Failed);
        assert_eq!(
            store.lock()[0].error.as_ref().map(|e| e.code),
            Some(codes::TRANSPORT)
        );

        f.bridge.reconnect().await.unwrap();
        assert_eq!(f.bridge.state(), ConnectionState::Connected);
        assert_eq!(remote_commands(&f.broker, "feed", true), 2);

        f.broker.publish("feed", MessageKind::Data, json!("back"));
        f.bridge.pump();
        assert_eq!(*seen.lock(), 1);
        assert!(monitor
            .drain()
            .iter()
            .any(|e| matches!(e, MonitorEvent::GalacticBound { channel } if channel == "feed")));
    }

    #[tokio::test]
    async fn test_undecodable_frame_stays_connected() {
        let f = fabric(BridgeConfig::default());
        let mut errors = f.bridge.errors();
        f.bridge.connect().await.unwrap();
        let jokes = f.bridge.listen_galactic_stream("servbot");
        jokes.handle(|_| panic!("no joke should decode")).unwrap();

        f.broker.publish("servbot", MessageKind::Data, json!({"punchline": 1}));
        f.broker.inject_raw("not json at all");
        f.bridge.pump();

        assert_eq!(f.bridge.state(), ConnectionState::Connected);
        assert_eq!(f.bus.handler_failures(), 0);
        let kinds: Vec<_> = std::iter::from_fn(|| errors.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![ConnectionErrorKind::Decode, ConnectionErrorKind::Decode]);
    }
}
