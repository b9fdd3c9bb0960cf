#[cfg(test)]
mod tests {
    use conduit_config::{ConduitConfig, RegistryConfig};
    use conduit_core::*;
    use conduit_learning::{FailureKind, FailureSignature, Learner, RecoveryAction, SizeClass, TaskFeatures, Urgency};
    use conduit_runtime::*;
    use conduit_store::{ConversationStore, MemoryStore, SqliteStore};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn text_in() -> Schema {
        Schema::new().field("path", FieldType::String)
    }

    fn text_out() -> Schema {
        Schema::new().field("text", FieldType::String).field("pages", FieldType::Integer)
    }

    fn kb_in() -> Schema {
        Schema::new().field("content", FieldType::String).alias("content", "text")
    }

    fn client() -> ModuleDescriptor {
        ModuleDescriptor::new("client", ["client"], Schema::new(), Schema::new())
    }

    /// Retries without backoff and a greedy recovery agent, so routing
    /// tests are fast and their recovery choices are the priors.
    fn fast_config() -> ConduitConfig {
        let mut config = ConduitConfig::default();
        config.store.in_memory = true;
        config.router.retry_backoff_ms = 0;
        config.learning.recovery.epsilon = 0.0;
        config
    }

    async fn hub_with(config: ConduitConfig) -> Hub {
        let hub = Hub::in_memory(config).await.unwrap();
        hub.register(client(), Arc::new(MockAdapter::new("client")), false).unwrap();
        hub
    }

    fn registry_with(names: &[&str]) -> Arc<ModuleRegistry> {
        let registry = Arc::new(ModuleRegistry::new(&RegistryConfig::default(), EventBus::default()));
        for name in names {
            registry
                .register(ModuleDescriptor::new(*name, ["test"], Schema::new(), Schema::new()), false)
                .unwrap();
        }
        registry
    }

    fn manager_on(store: Arc<dyn ConversationStore>, names: &[&str]) -> ConversationManager {
        ConversationManager::new(store, registry_with(names), EventBus::default())
    }

    fn manager(names: &[&str]) -> ConversationManager {
        manager_on(Arc::new(MemoryStore::new()), names)
    }

    fn drain(rx: &mut broadcast::Receiver<HubEvent>) -> Vec<HubEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // ── Registry ───────────────────────────────────────────────

    #[test]
    fn test_register_is_idempotent_and_conflicts_on_schema_change() {
        let registry = ModuleRegistry::new(&RegistryConfig::default(), EventBus::default());
        let pdf = ModuleDescriptor::new("pdf_processor", ["pdf_extraction"], text_in(), text_out());

        assert!(registry.register(pdf.clone(), false).unwrap());
        assert!(!registry.register(pdf.clone(), false).unwrap());
        assert_eq!(registry.require("pdf_processor").unwrap().version, 0);

        let changed = ModuleDescriptor::new(
            "pdf_processor",
            ["pdf_extraction"],
            text_in(),
            Schema::new().field("text", FieldType::String),
        );
        let err = registry.register(changed.clone(), false).unwrap_err();
        assert!(matches!(err, ConduitError::RegistrationConflict { .. }));

        assert!(registry.register(changed, true).unwrap());
        let current = registry.require("pdf_processor").unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(current.output_schema.len(), 1);
    }

    #[test]
    fn test_register_validates_capabilities() {
        let config = RegistryConfig {
            allowed_capabilities: vec!["pdf_extraction".into()],
        };
        let registry = ModuleRegistry::new(&config, EventBus::default());

        let none = ModuleDescriptor::new("empty", Vec::<String>::new(), Schema::new(), Schema::new());
        assert!(matches!(
            registry.register(none, false),
            Err(ConduitError::InvalidRegistration { .. })
        ));

        let bad_tag = ModuleDescriptor::new("shouty", ["PDF Extraction"], Schema::new(), Schema::new());
        assert!(registry.register(bad_tag, false).is_err());

        let not_allowed = ModuleDescriptor::new("kb", ["knowledge_store"], Schema::new(), Schema::new());
        assert!(registry.register(not_allowed, false).is_err());

        let bad_limits = ModuleDescriptor::new("pdf", ["pdf_extraction"], Schema::new(), Schema::new()).with_limits(
            ResourceLimits {
                cpu_share: Bounds::new(0.5, 2.0),
                ..ResourceLimits::default()
            },
        );
        assert!(registry.register(bad_limits, false).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_health_gates_availability() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let registry = ModuleRegistry::new(&RegistryConfig::default(), events);
        for name in ["a", "b"] {
            registry
                .register(ModuleDescriptor::new(name, ["summarize"], Schema::new(), Schema::new()), false)
                .unwrap();
        }
        assert_eq!(registry.available("summarize").len(), 2);

        assert!(registry.set_health("a", false).unwrap());
        assert!(!registry.set_health("a", false).unwrap());
        let names: Vec<String> = registry.available("summarize").iter().map(|d| d.name.clone()).collect();
        assert_eq!(names, vec!["b".to_string()]);

        let changes = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, HubEvent::ModuleHealthChanged { healthy: false, .. }))
            .count();
        assert_eq!(changes, 1);

        assert!(matches!(registry.deregister("zzz"), Err(ConduitError::UnknownModule(_))));
        registry.deregister("b").unwrap();
        assert!(registry.available("summarize").is_empty());
    }

    // ── Negotiation ────────────────────────────────────────────

    #[tokio::test]
    async fn test_negotiate_is_idempotent_and_cached() {
        let hub = hub_with(fast_config()).await;
        hub.register_descriptor(ModuleDescriptor::new("pdf", ["pdf_extraction"], text_in(), text_out()), false)
            .unwrap();
        hub.register_descriptor(ModuleDescriptor::new("kb", ["knowledge_store"], kb_in(), Schema::new()), false)
            .unwrap();

        let first = hub.negotiator().negotiate("pdf", "kb", None).unwrap();
        let second = hub.negotiator().negotiate("pdf", "kb", None).unwrap();
        assert_eq!(first.canonical_bytes(), second.canonical_bytes());
        assert_eq!(hub.negotiator().cached(), 1);
        assert!(!first.inferred);
        assert_eq!(first.apply(&json!({"text": "hi", "pages": 3})), json!({"content": "hi"}));
        assert!((first.preserved_ratio() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_disjoint_schemas_are_incompatible() {
        let hub = hub_with(fast_config()).await;
        hub.register_descriptor(ModuleDescriptor::new("pdf", ["pdf_extraction"], text_in(), text_out()), false)
            .unwrap();
        hub.register_descriptor(
            ModuleDescriptor::new("geo", ["geocode"], Schema::new().field("lat", FieldType::Number), Schema::new()),
            false,
        )
        .unwrap();

        let err = hub.negotiator().negotiate("pdf", "geo", None).unwrap_err();
        assert!(matches!(err, ConduitError::SchemaIncompatible { .. }));
        assert_eq!(hub.negotiator().cached(), 0);
    }

    #[tokio::test]
    async fn test_schemaless_source_infers_from_sample() {
        let hub = hub_with(fast_config()).await;
        hub.register_descriptor(ModuleDescriptor::new("pdf", ["pdf_extraction"], text_in(), text_out()), false)
            .unwrap();

        assert!(hub.negotiator().negotiate("client", "pdf", None).is_err());

        let sample = json!({"path": "report.pdf", "debug": true});
        let contract = hub.negotiator().negotiate("client", "pdf", Some(&sample)).unwrap();
        assert!(contract.inferred);
        assert_eq!(contract.apply(&sample), json!({"path": "report.pdf"}));
        assert_eq!(hub.negotiator().cached(), 0);
    }

    #[tokio::test]
    async fn test_reregistration_invalidates_contracts() {
        let hub = hub_with(fast_config()).await;
        hub.register_descriptor(ModuleDescriptor::new("pdf", ["pdf_extraction"], text_in(), text_out()), false)
            .unwrap();
        hub.register_descriptor(ModuleDescriptor::new("kb", ["knowledge_store"], kb_in(), Schema::new()), false)
            .unwrap();
        let before = hub.negotiator().negotiate("pdf", "kb", None).unwrap();

        let narrower = ModuleDescriptor::new("pdf", ["pdf_extraction"], text_in(), Schema::new().field("text", FieldType::String));
        assert!(hub.register_descriptor(narrower, true).unwrap());
        assert_eq!(hub.negotiator().cached(), 0);

        let after = hub.negotiator().negotiate("pdf", "kb", None).unwrap();
        assert_ne!(before.source_fingerprint, after.source_fingerprint);
        assert!(after.transforms.iter().all(|t| !matches!(t, Transform::Drop { .. })));
    }

    #[tokio::test]
    async fn test_schemaless_target_receives_payload_untouched() {
        for infer in [true, false] {
            let mut config = fast_config();
            config.negotiation.infer_from_sample = infer;
            let hub = hub_with(config).await;
            let echo = Arc::new(MockAdapter::new("echo").always(MockReply::ok(json!({"ok": true}))));
            hub.register(
                ModuleDescriptor::new("echo", ["echo"], Schema::new(), Schema::new()),
                echo.clone(),
                false,
            )
            .unwrap();

            for payload in [json!("hello"), json!([1, 2, 3]), json!({"text": "keep me"}), json!(7)] {
                let outcome = hub
                    .route(RouteRequest::to("client", "echo", payload.clone()))
                    .await
                    .unwrap();
                assert_eq!(echo.last_invocation().unwrap().payload, payload, "infer_from_sample = {infer}");
                assert!(outcome.contract.pass_through);
                assert!(outcome.contract.is_identity());
                assert!(outcome.contract.unfilled.is_empty());
            }
            // one cached pass-through contract serves every payload shape
            assert_eq!(hub.negotiator().cached(), 1);
        }
    }

    #[tokio::test]
    async fn test_declared_output_into_schemaless_target_is_pass_through() {
        let hub = hub_with(fast_config()).await;
        hub.register_descriptor(ModuleDescriptor::new("pdf", ["pdf_extraction"], text_in(), text_out()), false)
            .unwrap();
        hub.register_descriptor(ModuleDescriptor::new("sink", ["archive"], Schema::new(), Schema::new()), false)
            .unwrap();

        let contract = hub.negotiator().negotiate("pdf", "sink", None).unwrap();
        assert!(contract.pass_through);
        assert!(!contract.inferred);
        let extra = json!({"text": "t", "pages": 2, "undeclared": [1]});
        assert_eq!(contract.apply(&extra), extra);
        assert!((contract.preserved_ratio() - 1.0).abs() < 1e-9);
    }

    // ── Conversations ──────────────────────────────────────────

    #[tokio::test]
    async fn test_create_requires_two_known_participants() {
        let manager = manager(&["a", "b"]);
        assert!(matches!(
            manager.create_conversation(vec!["a".into(), "a".into()]).await,
            Err(ConduitError::InvalidParticipants(_))
        ));
        assert!(matches!(
            manager.create_conversation(vec!["a".into(), "ghost".into()]).await,
            Err(ConduitError::UnknownModule(_))
        ));

        let id = manager.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();
        let state = manager.get_conversation_state(id).await.unwrap();
        assert_eq!(state.status, ConversationStatus::Initiated);
        assert_eq!(state.turn_counter, 0);
    }

    #[tokio::test]
    async fn test_duplicate_turn_is_rejected() {
        let manager = manager(&["a", "b"]);
        let id = manager.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();

        let outcome = manager
            .route_message(id, Message::new(id, "a", "b", 0, json!({"q": 1})))
            .await
            .unwrap();
        assert_eq!(outcome.turn, 0);
        assert_eq!(outcome.status, ConversationStatus::Active);

        let err = manager
            .route_message(id, Message::new(id, "a", "b", 0, json!({"q": 2})))
            .await
            .unwrap_err();
        match err {
            ConduitError::OutOfOrderTurn { expected, got, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(got, 0);
            }
            other => panic!("expected OutOfOrderTurn, got {other}"),
        }
        assert_eq!(manager.get_conversation_state(id).await.unwrap().turn_counter, 1);
        assert_eq!(manager.history(id).await.unwrap().len(), 1);

        let skipped_ahead = manager
            .route_message(id, Message::new(id, "b", "a", 5, json!(null)))
            .await;
        assert!(matches!(skipped_ahead, Err(ConduitError::OutOfOrderTurn { .. })));
    }

    #[tokio::test]
    async fn test_outsiders_cannot_speak() {
        let manager = manager(&["a", "b", "c"]);
        let id = manager.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();

        let err = manager
            .route_message(id, Message::new(id, "c", "a", 0, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ConduitError::InvalidParticipants(_)));

        manager.join(id, "c").await.unwrap();
        manager
            .route_message(id, Message::new(id, "c", "a", 0, json!({})))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_turns_stay_gapless_under_racing_writers() {
        let manager = Arc::new(manager(&["a", "b"]));
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..6 {
            let id = manager.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();
            let writers: usize = rng.random_range(2..6);
            let per_writer: usize = rng.random_range(3..9);
            let plans: Vec<Vec<u64>> = (0..writers)
                .map(|_| (0..per_writer).map(|_| rng.random_range(0..3)).collect())
                .collect();

            let handles: Vec<_> = plans
                .into_iter()
                .enumerate()
                .map(|(writer, delays)| {
                    let manager = Arc::clone(&manager);
                    tokio::spawn(async move {
                        for (seq, delay) in delays.into_iter().enumerate() {
                            loop {
                                tokio::time::sleep(Duration::from_millis(delay)).await;
                                let turn = manager.get_conversation_state(id).await.unwrap().turn_counter;
                                let msg = Message::new(id, "a", "b", turn, json!({"writer": writer, "seq": seq}));
                                match manager.route_message(id, msg).await {
                                    Ok(_) => break,
                                    Err(ConduitError::OutOfOrderTurn { .. }) => continue,
                                    Err(e) => panic!("unexpected error: {e}"),
                                }
                            }
                        }
                    })
                })
                .collect();
            for result in futures::future::join_all(handles).await {
                result.unwrap();
            }

            let history = manager.history(id).await.unwrap();
            let turns: Vec<u64> = history.iter().map(|m| m.turn).collect();
            let expected: Vec<u64> = (0..(writers * per_writer) as u64).collect();
            assert_eq!(turns, expected);

            let distinct: HashSet<String> = history.iter().map(|m| m.payload.to_string()).collect();
            assert_eq!(distinct.len(), writers * per_writer, "every write accepted exactly once");
            assert_eq!(
                manager.get_conversation_state(id).await.unwrap().turn_counter,
                (writers * per_writer) as u64
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_conversations_interleave_without_gaps() {
        let manager = Arc::new(manager(&["a", "b", "c"]));
        let mut rng = StdRng::seed_from_u64(0xc0ffee);

        for _ in 0..4 {
            let mut ids = Vec::new();
            for _ in 0..rng.random_range(3..7) {
                ids.push(manager.create_conversation(vec!["a".into(), "b".into(), "c".into()]).await.unwrap());
            }

            // every writer hops between conversations at random, so turns on
            // all of them interleave across worker threads
            let writers: usize = rng.random_range(3..7);
            let per_writer: usize = rng.random_range(5..12);
            let plans: Vec<Vec<(usize, u64)>> = (0..writers)
                .map(|_| {
                    (0..per_writer)
                        .map(|_| (rng.random_range(0..ids.len()), rng.random_range(0..3)))
                        .collect()
                })
                .collect();
            let mut expected = vec![0u64; ids.len()];
            for plan in &plans {
                for (target, _) in plan {
                    expected[*target] += 1;
                }
            }

            let handles: Vec<_> = plans
                .into_iter()
                .enumerate()
                .map(|(writer, plan)| {
                    let manager = Arc::clone(&manager);
                    let ids = ids.clone();
                    tokio::spawn(async move {
                        for (seq, (target, delay)) in plan.into_iter().enumerate() {
                            let id = ids[target];
                            loop {
                                tokio::time::sleep(Duration::from_millis(delay)).await;
                                let turn = manager.get_conversation_state(id).await.unwrap().turn_counter;
                                let msg = Message::new(id, "a", "c", turn, json!({"writer": writer, "seq": seq}));
                                match manager.route_message(id, msg).await {
                                    Ok(_) => break,
                                    Err(ConduitError::OutOfOrderTurn { .. }) => continue,
                                    Err(e) => panic!("unexpected error: {e}"),
                                }
                            }
                        }
                    })
                })
                .collect();
            for result in futures::future::join_all(handles).await {
                result.unwrap();
            }

            for (id, count) in ids.iter().zip(expected) {
                let history = manager.history(*id).await.unwrap();
                let turns: Vec<u64> = history.iter().map(|m| m.turn).collect();
                assert_eq!(turns, (0..count).collect::<Vec<u64>>());
                assert!(history.iter().all(|m| m.conversation_id == *id));
                assert_eq!(manager.get_conversation_state(*id).await.unwrap().turn_counter, count);
            }
        }
    }

    #[tokio::test]
    async fn test_idle_conversation_times_out_and_rejects_turns() {
        let manager = manager(&["a", "b"]);
        let idle = manager.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();
        manager
            .route_message(idle, Message::new(idle, "a", "b", 0, json!({})))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let fresh = manager.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();

        let timed_out = manager.cleanup_inactive(Duration::from_millis(30)).await.unwrap();
        assert_eq!(timed_out, vec![idle]);
        assert_eq!(manager.active_ids(), vec![fresh]);

        let state = manager.get_conversation_state(idle).await.unwrap();
        assert_eq!(state.status, ConversationStatus::TimedOut);

        let err = manager
            .route_message(idle, Message::new(idle, "b", "a", 1, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConduitError::ConversationClosed {
                status: ConversationStatus::TimedOut,
                turn: 1,
                ..
            }
        ));
        assert_eq!(manager.history(idle).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_skips_conversation_mid_exchange() {
        let manager = manager(&["a", "b"]);
        let id = manager.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let lock = manager.run_lock(id).await;
        let guard = lock.lock().await;
        assert!(manager.cleanup_inactive(Duration::from_millis(1)).await.unwrap().is_empty());
        drop(guard);

        assert_eq!(manager.cleanup_inactive(Duration::from_millis(1)).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let manager = manager(&["a", "b"]);
        let id = manager.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();

        manager.close_conversation(id).await.unwrap();
        manager.close_conversation(id).await.unwrap();
        assert_eq!(
            manager.get_conversation_state(id).await.unwrap().status,
            ConversationStatus::Closed
        );
        assert_eq!(manager.active_count(), 0);
        assert!(matches!(
            manager.close_conversation(uuid::Uuid::new_v4()).await,
            Err(ConduitError::ConversationNotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_of_stored_conversation_serializes_with_turns() {
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
        let creator = manager_on(Arc::clone(&store), &["a", "b"]);

        for round in 0..20 {
            let id = creator.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();
            // a second manager on the same store holds nothing in memory
            let manager = Arc::new(manager_on(Arc::clone(&store), &["a", "b"]));

            let sender = {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.send(id, "a", "b", json!({"round": round}), None).await })
            };
            let closer = {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.close_conversation(id).await })
            };
            let sent = sender.await.unwrap();
            closer.await.unwrap().unwrap();

            let row = store.load_conversation(id).await.unwrap().unwrap();
            let history = store.load_messages(id).await.unwrap();
            assert_eq!(row.status, ConversationStatus::Closed);
            assert_eq!(row.turn_counter, history.len() as u64, "round {round}");
            match sent {
                Ok(_) => assert_eq!(history.len(), 1),
                Err(e) => {
                    assert!(matches!(e, ConduitError::ConversationClosed { .. }), "round {round}: {e}");
                    assert!(history.is_empty());
                }
            }
            assert_eq!(manager.active_count(), 0);
        }

        // a timed-out row stays timed out
        let id = creator.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();
        let mut row = store.load_conversation(id).await.unwrap().unwrap();
        row.status = ConversationStatus::TimedOut;
        store.save_conversation(&row).await.unwrap();
        let manager = manager_on(Arc::clone(&store), &["a", "b"]);
        manager.close_conversation(id).await.unwrap();
        assert_eq!(
            store.load_conversation(id).await.unwrap().unwrap().status,
            ConversationStatus::TimedOut
        );
    }

    #[tokio::test]
    async fn test_context_updates_and_waiting_state() {
        let manager = manager(&["a", "b"]);
        let id = manager.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();
        manager.update_context(id, "topic", json!("invoices")).await.unwrap();

        // WAITING only follows ACTIVE
        manager.set_waiting(id, true).await.unwrap();
        assert_eq!(
            manager.get_conversation_state(id).await.unwrap().status,
            ConversationStatus::Initiated
        );

        manager
            .route_message(id, Message::new(id, "a", "b", 0, json!({})))
            .await
            .unwrap();
        manager.set_waiting(id, true).await.unwrap();
        let state = manager.get_conversation_state(id).await.unwrap();
        assert_eq!(state.status, ConversationStatus::Waiting);
        assert_eq!(state.context["topic"], json!("invoices"));

        let reply = manager
            .route_message(id, Message::new(id, "b", "a", 1, json!({})))
            .await
            .unwrap();
        assert_eq!(reply.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn test_restore_resumes_numbering_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conduit.db");

        let id = {
            let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::open(&path).unwrap());
            let manager = manager_on(store, &["a", "b"]);
            let id = manager.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();
            manager
                .route_message(id, Message::new(id, "a", "b", 0, json!({"q": "hi"})))
                .await
                .unwrap();
            let closed = manager.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();
            manager.close_conversation(closed).await.unwrap();
            id
        };

        let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::open(&path).unwrap());
        let manager = manager_on(store, &["a", "b"]);
        assert_eq!(manager.restore_active().await.unwrap(), 1);
        assert_eq!(manager.active_ids(), vec![id]);

        let outcome = manager
            .route_message(id, Message::new(id, "b", "a", 1, json!({"a": "hello"})))
            .await
            .unwrap();
        assert_eq!(outcome.turn, 1);
        assert_eq!(manager.history(id).await.unwrap().len(), 2);
    }

    // ── Routing ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_route_to_explicit_target() {
        let hub = hub_with(fast_config()).await;
        let pdf = Arc::new(MockAdapter::new("pdf").always(MockReply::ok(json!({"text": "hello", "pages": 2}))));
        hub.register(
            ModuleDescriptor::new("pdf", ["pdf_extraction"], text_in(), text_out()),
            pdf.clone(),
            false,
        )
        .unwrap();

        let outcome = hub
            .route(RouteRequest::to("client", "pdf", json!({"path": "a.pdf", "verbose": true})).with_action("extract"))
            .await
            .unwrap();

        assert_eq!(outcome.module, "pdf");
        assert_eq!(outcome.output, json!({"text": "hello", "pages": 2}));
        assert_eq!(outcome.request_turn, Some(0));
        assert_eq!(outcome.reply_turn, Some(1));
        assert_eq!(outcome.retries, 0);
        assert!(!outcome.skipped);

        let invocation = pdf.last_invocation().unwrap();
        assert_eq!(invocation.payload, json!({"path": "a.pdf"}));
        assert_eq!(invocation.action.as_deref(), Some("extract"));
        let limits = hub.registry().require("pdf").unwrap().limits;
        assert!(invocation.allocation.within(&limits));

        let history = hub.conversations().history(outcome.conversation_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].source, "pdf");
        assert_eq!(history[1].in_reply_to, Some(history[0].id));
        let state = hub.conversations().get_conversation_state(outcome.conversation_id).await.unwrap();
        assert_eq!(state.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn test_route_continues_existing_conversation() {
        let hub = hub_with(fast_config()).await;
        hub.register(
            ModuleDescriptor::new("pdf", ["pdf_extraction"], text_in(), text_out()),
            Arc::new(MockAdapter::new("pdf").always(MockReply::ok(json!({"text": "t", "pages": 1})))),
            false,
        )
        .unwrap();
        hub.register(
            ModuleDescriptor::new("kb", ["knowledge_store"], kb_in(), Schema::new()),
            Arc::new(MockAdapter::new("kb")),
            false,
        )
        .unwrap();

        let first = hub
            .route(RouteRequest::to("client", "pdf", json!({"path": "a.pdf"})))
            .await
            .unwrap();
        let second = hub
            .route(RouteRequest::to("pdf", "kb", first.output.clone()).in_conversation(first.conversation_id))
            .await
            .unwrap();

        assert_eq!(second.conversation_id, first.conversation_id);
        assert_eq!(second.request_turn, Some(2));
        assert_eq!(second.output, json!({"content": "t"}));
        let state = hub.conversations().get_conversation_state(first.conversation_id).await.unwrap();
        assert_eq!(state.turn_counter, 4);
        assert!(state.is_participant("kb"));

        hub.conversations().close_conversation(first.conversation_id).await.unwrap();
        let err = hub
            .route(RouteRequest::to("client", "pdf", json!({"path": "b.pdf"})).in_conversation(first.conversation_id))
            .await
            .unwrap_err();
        assert!(matches!(err.error, ConduitError::ConversationClosed { .. }));
    }

    #[tokio::test]
    async fn test_structural_errors_are_not_retried() {
        let hub = hub_with(fast_config()).await;
        let geo = Arc::new(MockAdapter::new("geo"));
        hub.register(
            ModuleDescriptor::new("geo", ["geocode"], Schema::new().field("lat", FieldType::Number), Schema::new()),
            geo.clone(),
            false,
        )
        .unwrap();

        let err = hub
            .route(RouteRequest::to("ghost", "geo", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_module");

        let err = hub
            .route(RouteRequest::to("client", "geo", json!({"city": "Oslo"})))
            .await
            .unwrap_err();
        assert!(matches!(err.error, ConduitError::SchemaIncompatible { .. }));
        assert!(err.attempted.is_empty());
        assert_eq!(geo.calls(), 0);

        let err = hub
            .route(RouteRequest::by_capability("client", "translate", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err.error, ConduitError::RoutingFailure { .. }));
    }

    #[tokio::test]
    async fn test_retry_ceiling_is_enforced() {
        let mut config = fast_config();
        config.router.max_retries = 3;
        let hub = hub_with(config).await;
        let flaky = Arc::new(MockAdapter::new("flaky").always(MockReply::err(AdapterError::Timeout)));
        hub.register(
            ModuleDescriptor::new("flaky", ["summarize"], Schema::new(), Schema::new()),
            flaky.clone(),
            false,
        )
        .unwrap();
        let mut rx = hub.subscribe();

        let err = hub
            .route(RouteRequest::to("client", "flaky", json!({"text": "long"})))
            .await
            .unwrap_err();

        match &err.error {
            ConduitError::RetryBudgetExhausted { attempts, .. } => assert_eq!(*attempts, 4),
            other => panic!("expected RetryBudgetExhausted, got {other}"),
        }
        assert_eq!(flaky.calls(), 4);
        assert_eq!(err.retries, 3);
        assert_eq!(err.attempted, vec!["flaky".to_string(); 4]);
        assert_eq!(err.turn, Some(3));
        assert!(err.conversation_id.is_some());

        let retries = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, HubEvent::RecoveryChosen { action, .. } if action == "retry"))
            .count();
        assert_eq!(retries, 3);

        let state = hub
            .conversations()
            .get_conversation_state(err.conversation_id.unwrap())
            .await
            .unwrap();
        assert_eq!(state.status, ConversationStatus::Active);
        assert_eq!(state.turn_counter, 4);
    }

    #[tokio::test]
    async fn test_deadline_cancels_slow_module() {
        let mut config = fast_config();
        config.router.max_retries = 1;
        let hub = hub_with(config).await;
        let slow = Arc::new(MockAdapter::new("slow").with_latency(Duration::from_millis(500)));
        let limits = ResourceLimits {
            timeout_ms: Bounds::new(20.0, 20.0),
            ..ResourceLimits::default()
        };
        hub.register(
            ModuleDescriptor::new("slow", ["summarize"], Schema::new(), Schema::new()).with_limits(limits),
            slow.clone(),
            false,
        )
        .unwrap();

        let started = std::time::Instant::now();
        let err = hub
            .route(RouteRequest::to("client", "slow", json!({"text": "x"})))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(400));
        match &err.error {
            ConduitError::RetryBudgetExhausted { attempts, last_error } => {
                assert_eq!(*attempts, 2);
                assert!(last_error.contains("timed out after 20ms"));
            }
            other => panic!("expected RetryBudgetExhausted, got {other}"),
        }
        assert_eq!(hub.router().in_flight("slow"), 0);
    }

    #[tokio::test]
    async fn test_fallback_serves_from_alternate_provider() {
        let hub = hub_with(fast_config()).await;
        let broken = Arc::new(
            MockAdapter::new("broken_pdf").always(MockReply::err(AdapterError::Unavailable("disk full".into()))),
        );
        let pdf = Arc::new(MockAdapter::new("pdf_processor").always(MockReply::ok(json!({"text": "ok", "pages": 1}))));
        hub.register(
            ModuleDescriptor::new("broken_pdf", ["pdf_extraction"], text_in(), text_out()),
            broken.clone(),
            false,
        )
        .unwrap();
        hub.register(
            ModuleDescriptor::new("pdf_processor", ["pdf_extraction"], text_in(), text_out()),
            pdf.clone(),
            false,
        )
        .unwrap();

        // untried arms go first in name order, so the broken module is pulled first
        let outcome = hub
            .route(RouteRequest::by_capability("client", "pdf_extraction", json!({"path": "a.pdf"})))
            .await
            .unwrap();
        assert_eq!(outcome.module, "pdf_processor");
        assert_eq!(outcome.retries, 1);
        assert_eq!(broken.calls(), 1);
        let state = hub.conversations().get_conversation_state(outcome.conversation_id).await.unwrap();
        assert!(state.is_participant("broken_pdf") && state.is_participant("pdf_processor"));
    }

    #[tokio::test]
    async fn test_bandit_converges_on_working_module() {
        let mut config = fast_config();
        config.router.breaker_threshold = 1_000;
        let hub = hub_with(config).await;
        hub.register(
            ModuleDescriptor::new("broken_pdf", ["pdf_extraction"], text_in(), text_out()),
            Arc::new(
                MockAdapter::new("broken_pdf").always(MockReply::err(AdapterError::Unavailable("crashed".into()))),
            ),
            false,
        )
        .unwrap();
        hub.register(
            ModuleDescriptor::new("pdf_processor", ["pdf_extraction"], text_in(), text_out()),
            Arc::new(MockAdapter::new("pdf_processor").always(MockReply::ok(json!({"text": "ok", "pages": 1})))),
            false,
        )
        .unwrap();

        let mut first_choice_hits = Vec::new();
        for i in 0..100 {
            let outcome = hub
                .route(
                    RouteRequest::by_capability("client", "pdf_extraction", json!({"path": format!("{i}.pdf")}))
                        .with_task_type("pdf"),
                )
                .await
                .unwrap();
            assert_eq!(outcome.module, "pdf_processor");
            first_choice_hits.push(outcome.retries == 0);
        }

        let late_hits = first_choice_hits[80..].iter().filter(|hit| **hit).count();
        assert!(late_hits >= 18, "only {late_hits} of the last 20 went straight to pdf_processor");

        let features = TaskFeatures {
            task_type: "pdf".into(),
            capability: "pdf_extraction".into(),
            size_class: SizeClass::of_payload(&json!({"path": "0.pdf"})),
            urgency: Urgency::Normal,
            candidates: Vec::new(),
        };
        let good = hub.engine().bandit.arm(&features, "pdf_processor");
        let bad = hub.engine().bandit.arm(&features, "broken_pdf");
        assert!(good.mean_reward > bad.mean_reward);
        assert!(good.pulls > bad.pulls);
    }

    #[tokio::test]
    async fn test_breaker_flips_health_until_probe_succeeds() {
        let mut config = fast_config();
        config.router.max_retries = 0;
        config.router.breaker_threshold = 2;
        let hub = hub_with(config).await;
        let flaky = Arc::new(MockAdapter::new("flaky").always(MockReply::err(AdapterError::Unavailable("503".into()))));
        hub.register(
            ModuleDescriptor::new("flaky", ["summarize"], Schema::new(), Schema::new()),
            flaky.clone(),
            false,
        )
        .unwrap();
        let mut rx = hub.subscribe();

        for _ in 0..2 {
            let err = hub
                .route(RouteRequest::to("client", "flaky", json!({})))
                .await
                .unwrap_err();
            assert!(matches!(err.error, ConduitError::RetryBudgetExhausted { attempts: 1, .. }));
        }
        assert!(hub.router().circuit_open("flaky"));
        assert!(!hub.registry().require("flaky").unwrap().healthy);
        assert!(hub.registry().available("summarize").is_empty());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            HubEvent::ModuleHealthChanged { module, healthy: false } if module == "flaky"
        )));

        // rejected by the open circuit without reaching the adapter
        assert!(hub.route(RouteRequest::to("client", "flaky", json!({}))).await.is_err());
        assert_eq!(flaky.calls(), 2);

        let probed = hub.refresh_health().await;
        assert!(probed.contains(&("flaky".to_string(), true)));
        assert!(!hub.router().circuit_open("flaky"));
        assert!(hub.registry().require("flaky").unwrap().healthy);

        flaky.set_healthy(false);
        let probed = hub.refresh_health().await;
        assert!(probed.contains(&("flaky".to_string(), false)));
        assert!(!hub.registry().require("flaky").unwrap().healthy);
    }

    /// Teach the recovery agent that `action` pays off for `signature`.
    fn prefer(hub: &Hub, signature: &FailureSignature, action: RecoveryAction) {
        for _ in 0..30 {
            hub.engine().recovery.observe(signature, &action, 10.0, None);
        }
    }

    #[tokio::test]
    async fn test_escalation_reaches_the_event_bus() {
        let hub = hub_with(fast_config()).await;
        hub.register(
            ModuleDescriptor::new("vault", ["secrets"], Schema::new(), Schema::new()),
            Arc::new(MockAdapter::new("vault").always(MockReply::err(AdapterError::Unavailable("sealed".into())))),
            false,
        )
        .unwrap();
        let signature = FailureSignature {
            kind: FailureKind::Unavailable,
            attempt: 0,
            elapsed_ms: 0,
            has_alternate: false,
            skippable: false,
        };
        prefer(&hub, &signature, RecoveryAction::Escalate);
        let mut rx = hub.subscribe();

        let err = hub
            .route(RouteRequest::to("client", "vault", json!({"key": "db"})))
            .await
            .unwrap_err();
        assert!(matches!(err.error, ConduitError::Escalated { .. }));
        assert_eq!(err.kind(), "escalated");

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, HubEvent::Escalated { module, .. } if module == "vault")));
        assert!(events.iter().any(|e| matches!(
            e,
            HubEvent::RecoveryChosen { action, attempt: 0, .. } if action == "escalate"
        )));
    }

    #[tokio::test]
    async fn test_skippable_request_can_be_skipped() {
        let hub = hub_with(fast_config()).await;
        let audit = Arc::new(MockAdapter::new("audit").always(MockReply::err(AdapterError::Unavailable("down".into()))));
        hub.register(
            ModuleDescriptor::new("audit", ["audit_log"], Schema::new(), Schema::new()),
            audit.clone(),
            false,
        )
        .unwrap();
        let signature = FailureSignature {
            kind: FailureKind::Unavailable,
            attempt: 0,
            elapsed_ms: 0,
            has_alternate: false,
            skippable: true,
        };
        prefer(&hub, &signature, RecoveryAction::Skip);

        let outcome = hub
            .route(RouteRequest::to("client", "audit", json!({"note": "done"})).skippable())
            .await
            .unwrap();
        assert!(outcome.skipped);
        assert_eq!(outcome.output, Value::Null);
        assert_eq!(outcome.reply_turn, None);
        assert_eq!(audit.calls(), 1);
    }

    #[tokio::test]
    async fn test_routing_records_experience() {
        let hub = hub_with(fast_config()).await;
        hub.register(
            ModuleDescriptor::new("pdf_processor", ["pdf_extraction"], text_in(), text_out()),
            Arc::new(MockAdapter::new("pdf_processor")),
            false,
        )
        .unwrap();
        hub.route(RouteRequest::by_capability("client", "pdf_extraction", json!({"path": "a.pdf"})))
            .await
            .unwrap();

        let selections = hub
            .engine()
            .experience
            .sample(DecisionType::ModuleSelection, 10)
            .await
            .unwrap();
        assert_eq!(selections.len(), 1);
        assert!(selections[0].reward > 0.0);

        let allocations = hub
            .engine()
            .experience
            .sample(DecisionType::ResourceAllocation, 10)
            .await
            .unwrap();
        assert_eq!(allocations.len(), 1);
    }

    // ── Pipelines ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_pipeline_threads_outputs_between_steps() {
        let hub = hub_with(fast_config()).await;
        let pdf = Arc::new(MockAdapter::new("pdf").always(MockReply::ok(json!({"text": "hello", "pages": 2}))));
        let kb = Arc::new(MockAdapter::new("kb").always(MockReply::ok(json!({"stored": true}))));
        hub.register(ModuleDescriptor::new("pdf", ["pdf_extraction"], text_in(), text_out()), pdf.clone(), false)
            .unwrap();
        hub.register(
            ModuleDescriptor::new(
                "kb",
                ["knowledge_store"],
                kb_in(),
                Schema::new().field("stored", FieldType::Bool),
            ),
            kb.clone(),
            false,
        )
        .unwrap();
        hub.register(
            ModuleDescriptor::new("audit", ["audit_log"], Schema::new(), Schema::new()),
            Arc::new(MockAdapter::new("audit")),
            false,
        )
        .unwrap();

        let spec: PipelineSpec = serde_json::from_value(json!({
            "name": "ingest",
            "steps": [
                {"name": "extract", "module": "pdf", "input": {"path": "a.pdf"}},
                {"name": "store", "module": "kb", "input": "$previous.output"},
                {"name": "audit", "module": "audit", "input": {"note": "done"}, "optional": true},
            ]
        }))
        .unwrap();

        let report = hub.run_pipeline(&spec, "client").await.unwrap();

        let extract_at = report.executed.iter().position(|s| s == "extract").unwrap();
        let store_at = report.executed.iter().position(|s| s == "store").unwrap();
        assert!(extract_at < store_at);
        assert_eq!(
            report.executed.iter().filter(|s| *s == "audit").count() + report.not_run.len(),
            1
        );
        assert!(report.skipped.is_empty());
        assert_eq!(report.outputs["store"], json!({"stored": true}));
        assert_eq!(kb.last_invocation().unwrap().payload, json!({"content": "hello"}));
        if report.executed.iter().any(|s| s == "audit") {
            assert_eq!(report.outputs["audit"], json!({"note": "done"}));
        }

        let conversation_id = report.conversation_id.unwrap();
        let state = hub.conversations().get_conversation_state(conversation_id).await.unwrap();
        assert_eq!(state.context["extract"], json!({"text": "hello", "pages": 2}));
        assert_eq!(state.context["store"], json!({"stored": true}));
        assert_eq!(state.turn_counter, 2 * report.executed.len() as u64);

        let sequencing = hub
            .engine()
            .experience
            .sample(DecisionType::PipelineSequencing, 10)
            .await
            .unwrap();
        assert!(sequencing.len() >= 2);
    }

    #[tokio::test]
    async fn test_invalid_pipeline_is_rejected_before_routing() {
        let hub = hub_with(fast_config()).await;
        let spec = PipelineSpec {
            name: "empty".into(),
            steps: Vec::new(),
        };
        let err = hub.run_pipeline(&spec, "client").await.unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.conversation_id.is_none());
    }

    // ── Sweeper & Hub lifecycle ────────────────────────────────

    #[tokio::test]
    async fn test_sweeper_times_out_idle_conversations() {
        let manager = Arc::new(manager(&["a", "b"]));
        let id = manager.create_conversation(vec!["a".into(), "b".into()]).await.unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        let handle = spawn_sweeper(
            Arc::clone(&manager),
            Duration::from_millis(20),
            Duration::from_millis(10),
            cancel.clone(),
        );

        let mut status = ConversationStatus::Initiated;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = manager.get_conversation_state(id).await.unwrap().status;
            if status == ConversationStatus::TimedOut {
                break;
            }
        }
        assert_eq!(status, ConversationStatus::TimedOut);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_adapter_must_match_descriptor() {
        let hub = hub_with(fast_config()).await;
        let err = hub
            .register(
                ModuleDescriptor::new("pdf", ["pdf_extraction"], text_in(), text_out()),
                Arc::new(MockAdapter::new("kb")),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, ConduitError::InvalidRegistration { .. }));
        assert!(hub.registry().get("pdf").is_none());
    }

    #[tokio::test]
    async fn test_hubs_are_isolated() {
        let one = hub_with(fast_config()).await;
        let two = Hub::in_memory(fast_config()).await.unwrap();
        one.register(
            ModuleDescriptor::new("pdf", ["pdf_extraction"], text_in(), text_out()),
            Arc::new(MockAdapter::new("pdf")),
            false,
        )
        .unwrap();
        assert_eq!(one.registry().len(), 2);
        assert!(two.registry().is_empty());
        one.shutdown().await;
        two.shutdown().await;
    }

    #[tokio::test]
    async fn test_hub_restart_restores_state_and_learning() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.store.in_memory = false;
        config.store.db_path = dir.path().join("data").join("conduit.db");

        let payload = json!({"path": "a.pdf"});
        let conversation_id = {
            let hub = Hub::open(config.clone()).await.unwrap();
            hub.register(client(), Arc::new(MockAdapter::new("client")), false).unwrap();
            hub.register(
                ModuleDescriptor::new("pdf_processor", ["pdf_extraction"], text_in(), text_out()),
                Arc::new(MockAdapter::new("pdf_processor")),
                false,
            )
            .unwrap();
            let outcome = hub
                .route(RouteRequest::by_capability("client", "pdf_extraction", payload.clone()).with_task_type("pdf"))
                .await
                .unwrap();
            hub.shutdown().await;
            outcome.conversation_id
        };

        let hub = Hub::open(config).await.unwrap();
        assert!(hub.conversations().active_ids().contains(&conversation_id));
        assert_eq!(hub.conversations().history(conversation_id).await.unwrap().len(), 2);

        let features = TaskFeatures {
            task_type: "pdf".into(),
            capability: "pdf_extraction".into(),
            size_class: SizeClass::of_payload(&payload),
            urgency: Urgency::Normal,
            candidates: Vec::new(),
        };
        assert_eq!(hub.engine().bandit.arm(&features, "pdf_processor").pulls, 1);
        hub.shutdown().await;
    }
}
