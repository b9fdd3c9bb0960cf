#[cfg(test)]
mod tests {
    use conduit_config::ConfigLoader;
    use conduit_config::schema::*;
    use std::collections::HashMap;
    use std::io::Write;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_router_config_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.breaker_threshold, 5);
        assert_eq!(config.default_priority, 5);
        assert!(config.renegotiate_on_retry);
    }

    #[test]
    fn test_conversation_config_defaults() {
        let config = ConversationConfig::default();
        assert_eq!(config.max_idle_secs, 1800);
        assert_eq!(config.sweep_interval_secs, 60);
    }

    #[test]
    fn test_learning_config_defaults() {
        let config = LearningConfig::default();
        assert_eq!(config.bandit.policy, ExplorationPolicy::EpsilonGreedy);
        assert!(config.bandit.epsilon_min <= config.bandit.epsilon);
        assert!(config.reward.completion > config.reward.failure);
        assert!(config.reward.floor <= config.reward.failure);
    }

    #[test]
    fn test_defaults_validate_cleanly() {
        let warnings = ConduitConfig::default().validate().unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
    }

    // ── TOML tests ─────────────────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = ConduitConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: ConduitConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.router.max_retries, config.router.max_retries);
        assert_eq!(restored.learning.seed, config.learning.seed);
        assert_eq!(restored.store.db_path, config.store.db_path);
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[router]
max_retries = 5

[learning.bandit]
policy = "ucb"
ucb_c = 2.0
"#;
        let config: ConduitConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.router.max_retries, 5);
        assert_eq!(config.learning.bandit.policy, ExplorationPolicy::Ucb);
        assert_eq!(config.learning.bandit.ucb_c, 2.0);
        // Defaults fill in
        assert_eq!(config.router.breaker_threshold, 5);
        assert_eq!(config.learning.bandit.epsilon, 0.2);
        assert_eq!(config.conversations.max_idle_secs, 1800);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: ConduitConfig = toml::from_str("").unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(config.registry.allowed_capabilities.is_empty());
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_zero_sweep_interval_is_error() {
        let mut config = ConduitConfig::default();
        config.conversations.sweep_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("sweep_interval_secs"));
    }

    #[test]
    fn test_epsilon_out_of_range_is_error() {
        let mut config = ConduitConfig::default();
        config.learning.bandit.epsilon = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_high_retry_count_is_warning() {
        let mut config = ConduitConfig::default();
        config.router.max_retries = 20;
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "router.max_retries");
        assert_eq!(warnings[0].severity, WarningSeverity::Warning);
    }

    #[test]
    fn test_unknown_log_format_is_warning() {
        let mut config = ConduitConfig::default();
        config.logging.format = "xml".into();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "logging.format"));
    }

    #[test]
    fn test_inverted_reward_tiers_is_error() {
        let mut config = ConduitConfig::default();
        config.learning.reward.completion = -3.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_warning_display_includes_hint() {
        let warning = ConfigWarning {
            field: "router.max_retries".into(),
            message: "too high".into(),
            severity: WarningSeverity::Warning,
            hint: Some("lower it".into()),
        };
        assert_eq!(warning.to_string(), "warning: router.max_retries: too high (lower it)");
    }

    // ── Loader tests ───────────────────────────────────────────

    #[test]
    fn test_loader_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[conversations]\nmax_idle_secs = 42\n").unwrap();
        let loader = ConfigLoader::load(Some(file.path())).unwrap();
        assert_eq!(loader.get().conversations.max_idle_secs, 42);
        assert_eq!(loader.path(), file.path());
    }

    #[test]
    fn test_loader_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(loader.get().conversations.sweep_interval_secs, 60);
    }

    #[test]
    fn test_loader_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[router]\nbreaker_threshold = 0\n").unwrap();
        assert!(ConfigLoader::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_loader_rejects_malformed_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[router\nmax_retries = ").unwrap();
        let err = ConfigLoader::load(Some(file.path())).err().unwrap();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_reload_keeps_config_on_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[conversations]\nmax_idle_secs = 10\n").unwrap();
        let loader = ConfigLoader::load(Some(file.path())).unwrap();

        std::fs::write(file.path(), "[conversations]\nsweep_interval_secs = 0\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().conversations.max_idle_secs, 10);

        std::fs::write(file.path(), "[conversations]\nmax_idle_secs = 99\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().conversations.max_idle_secs, 99);
    }

    #[test]
    fn test_env_overrides_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CONDUIT_MAX_RETRIES", "7"),
            ("CONDUIT_SEED", "1234"),
            ("CONDUIT_DB_PATH", "/tmp/hub.db"),
            ("CONDUIT_LOG_LEVEL", "debug"),
        ]);
        let config = ConfigLoader::apply_overrides_from(ConduitConfig::default(), |k| {
            env.get(k).map(|v| v.to_string())
        });
        assert_eq!(config.router.max_retries, 7);
        assert_eq!(config.learning.seed, 1234);
        assert_eq!(config.store.db_path, std::path::PathBuf::from("/tmp/hub.db"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_env_override_ignores_garbage() {
        let config = ConfigLoader::apply_overrides_from(ConduitConfig::default(), |k| {
            (k == "CONDUIT_MAX_RETRIES").then(|| "lots".to_string())
        });
        assert_eq!(config.router.max_retries, 3);
    }

    #[test]
    fn test_from_toml_validates() {
        assert!(ConfigLoader::from_toml("[router]\ndefault_priority = 50\n").is_err());
        let config = ConfigLoader::from_toml("[store]\nin_memory = true\n").unwrap();
        assert!(config.store.in_memory);
    }
}
