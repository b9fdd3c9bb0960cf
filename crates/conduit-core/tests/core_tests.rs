#[cfg(test)]
mod tests {
    use conduit_core::*;
    use serde_json::json;
    use uuid::Uuid;

    // ── Conversation status ────────────────────────────────────

    #[test]
    fn test_status_transitions() {
        use ConversationStatus::*;
        assert!(Initiated.can_transition_to(Active));
        assert!(Active.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Active));
        assert!(Active.can_transition_to(Closed));
        assert!(Waiting.can_transition_to(TimedOut));
        assert!(!Closed.can_transition_to(Active));
        assert!(!TimedOut.can_transition_to(Closed));
        assert!(!Active.can_transition_to(Initiated));
    }

    #[test]
    fn test_status_terminal() {
        assert!(ConversationStatus::Closed.is_terminal());
        assert!(ConversationStatus::TimedOut.is_terminal());
        assert!(!ConversationStatus::Waiting.is_terminal());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            ConversationStatus::Initiated,
            ConversationStatus::Active,
            ConversationStatus::Waiting,
            ConversationStatus::Closed,
            ConversationStatus::TimedOut,
        ] {
            let parsed: ConversationStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<ConversationStatus>().is_err());
    }

    #[test]
    fn test_status_serde_uses_screaming_case() {
        let json = serde_json::to_string(&ConversationStatus::TimedOut).unwrap();
        assert_eq!(json, "\"TIMED_OUT\"");
    }

    // ── Message ────────────────────────────────────────────────

    #[test]
    fn test_message_reply_reference() {
        let conv = Uuid::new_v4();
        let request = Message::new(conv, "a", "b", 0, json!({"q": 1}));
        let reply = Message::new(conv, "b", "a", 1, json!({"r": 2})).in_reply_to(request.id);
        assert_eq!(reply.in_reply_to, Some(request.id));
        assert_eq!(reply.turn, 1);
    }

    #[test]
    fn test_new_conversation_starts_initiated() {
        let conv = Conversation::new(vec!["a".into(), "b".into()]);
        assert_eq!(conv.status, ConversationStatus::Initiated);
        assert_eq!(conv.turn_counter, 0);
        assert!(conv.is_participant("a"));
        assert!(!conv.is_participant("c"));
    }

    // ── Schema compatibility ───────────────────────────────────

    #[test]
    fn test_field_compatibility() {
        assert_eq!(FieldType::String.compatibility(&FieldType::String, true), Compatibility::Exact);
        assert_eq!(FieldType::Integer.compatibility(&FieldType::Number, true), Compatibility::Coerce);
        assert_eq!(
            FieldType::Integer.compatibility(&FieldType::Number, false),
            Compatibility::Incompatible
        );
        assert_eq!(FieldType::Number.compatibility(&FieldType::Integer, true), Compatibility::Incompatible);
        assert_eq!(FieldType::Bool.compatibility(&FieldType::String, true), Compatibility::Coerce);
        assert_eq!(FieldType::Any.compatibility(&FieldType::Bool, false), Compatibility::Exact);
        assert_eq!(
            FieldType::array(FieldType::Integer).compatibility(&FieldType::array(FieldType::Number), true),
            Compatibility::Coerce
        );
    }

    #[test]
    fn test_nested_object_partial_overlap() {
        let source = FieldType::object(
            Schema::new().field("name", FieldType::String).field("age", FieldType::Integer),
        );
        let target = FieldType::object(Schema::new().field("name", FieldType::String));
        let disjoint = FieldType::object(Schema::new().field("lat", FieldType::Number));

        // a shared field makes nested objects compatible with or without coercion
        for allow_coercion in [true, false] {
            assert_eq!(source.compatibility(&target, allow_coercion), Compatibility::Coerce);
            assert_eq!(source.compatibility(&disjoint, allow_coercion), Compatibility::Incompatible);
        }
        assert_eq!(source.compatibility(&source.clone(), false), Compatibility::Exact);
    }

    #[test]
    fn test_pass_through_contract_keeps_payload_shape() {
        let contract = SchemaContract {
            source_module: "client".into(),
            target_module: "echo".into(),
            source_fingerprint: Schema::new().fingerprint(),
            target_fingerprint: Schema::new().fingerprint(),
            mappings: vec![],
            transforms: vec![],
            unfilled: vec![],
            source_field_count: 0,
            inferred: false,
            pass_through: true,
        };
        for payload in [json!("hello"), json!([1, 2]), json!({"text": "keep me"}), json!(null)] {
            assert_eq!(contract.apply(&payload), payload);
        }
        assert!(contract.is_identity());
    }

    #[test]
    fn test_schema_infer_from_sample() {
        let schema = Schema::infer(&json!({"title": "x", "pages": 3, "score": 0.5, "tags": ["a"]}));
        assert_eq!(schema.fields["title"].ty, FieldType::String);
        assert_eq!(schema.fields["pages"].ty, FieldType::Integer);
        assert_eq!(schema.fields["score"].ty, FieldType::Number);
        assert_eq!(schema.fields["tags"].ty, FieldType::array(FieldType::String));

        let scalar = Schema::infer(&json!("just text"));
        assert_eq!(scalar.fields["value"].ty, FieldType::String);
    }

    #[test]
    fn test_fingerprint_changes_with_schema() {
        let a = Schema::new().field("text", FieldType::String);
        let b = Schema::new().field("text", FieldType::String);
        let c = Schema::new().field("text", FieldType::String).optional("lang", FieldType::String);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 16);
    }

    #[test]
    fn test_schema_toml_shape() {
        let raw = r#"
[fields.text]
type = "string"

[fields.pages]
type = "integer"
required = false
aliases = ["page_count"]
"#;
        let schema: Schema = toml::from_str(raw).unwrap();
        assert_eq!(schema.fields["text"].ty, FieldType::String);
        assert!(schema.fields["text"].required);
        assert!(!schema.fields["pages"].required);
        assert_eq!(schema.fields["pages"].aliases, vec!["page_count".to_string()]);
    }

    // ── Contract application ───────────────────────────────────

    fn contract() -> SchemaContract {
        SchemaContract {
            source_module: "pdf".into(),
            target_module: "kb".into(),
            source_fingerprint: "s".into(),
            target_fingerprint: "t".into(),
            mappings: vec![
                FieldMapping {
                    source: "text".into(),
                    target: "content".into(),
                    source_type: FieldType::String,
                    target_type: FieldType::String,
                    coerced: false,
                },
                FieldMapping {
                    source: "pages".into(),
                    target: "pages".into(),
                    source_type: FieldType::Integer,
                    target_type: FieldType::Number,
                    coerced: true,
                },
            ],
            transforms: vec![
                Transform::Drop { field: "raw".into() },
                Transform::Rename { from: "text".into(), to: "content".into() },
            ],
            unfilled: vec![],
            source_field_count: 3,
            inferred: false,
            pass_through: false,
        }
    }

    #[test]
    fn test_contract_apply_drops_renames_coerces() {
        let out = contract().apply(&json!({"text": "hello", "pages": 4, "raw": "xx"}));
        assert_eq!(out["content"], json!("hello"));
        assert_eq!(out["pages"].as_f64(), Some(4.0));
        assert!(out.get("raw").is_none());
        assert!(out.get("text").is_none());
    }

    #[test]
    fn test_contract_preserved_ratio() {
        let c = contract();
        assert!((c.preserved_ratio() - 2.0 / 3.0).abs() < 1e-9);
        assert!(!c.is_identity());
        assert!(c.references("kb"));
        assert!(!c.references("llm"));
    }

    // ── Resource limits ────────────────────────────────────────

    #[test]
    fn test_limits_validation() {
        assert!(ResourceLimits::default().validate("m").is_ok());

        let mut bad = ResourceLimits::default();
        bad.cpu_share = Bounds::new(0.5, 0.1);
        assert!(matches!(bad.validate("m"), Err(ConduitError::InvalidRegistration { .. })));

        let mut fractional = ResourceLimits::default();
        fractional.timeout_ms = Bounds::new(100.5, 200.0);
        assert!(fractional.validate("m").is_err());
    }

    #[test]
    fn test_allocation_clipped_into_limits() {
        let limits = ResourceLimits::default();
        let alloc = Allocation::clipped(5.0, -1.0, 1e9, 42.0, &limits);
        assert!(alloc.within(&limits));
        assert_eq!(alloc.timeout_ms, 30_000);
        assert_eq!(alloc.priority, 10);
    }

    // ── Errors ─────────────────────────────────────────────────

    #[test]
    fn test_transient_classification() {
        assert!(ConduitError::Timeout { module: "m".into(), budget_ms: 10 }.is_transient());
        assert!(ConduitError::ModuleUnavailable { module: "m".into(), reason: "down".into() }.is_transient());
        assert!(!ConduitError::ConversationNotFound(Uuid::nil()).is_transient());
        assert!(
            !ConduitError::SchemaIncompatible {
                from_module: "a".into(),
                to_module: "b".into(),
                reason: "disjoint".into(),
            }
            .is_transient()
        );
    }

    #[test]
    fn test_adapter_error_conversion() {
        let err = AdapterError::Timeout.into_conduit("pdf", 250);
        assert!(matches!(err, ConduitError::Timeout { ref module, budget_ms: 250 } if module == "pdf"));
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_decision_type_parse() {
        assert_eq!("module-selection".parse::<DecisionType>().unwrap(), DecisionType::ModuleSelection);
        assert_eq!("error_recovery".parse::<DecisionType>().unwrap(), DecisionType::ErrorRecovery);
        assert!("nope".parse::<DecisionType>().is_err());
    }

    // ── Event bus ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_event_bus_delivers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(HubEvent::ModuleDeregistered { module: "x".into() });
        match rx.recv().await.unwrap() {
            HubEvent::ModuleDeregistered { module } => assert_eq!(module, "x"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
