use conduit_config::ConfigLoader;

const STARTER_CONFIG: &str = r#"# Conduit configuration
# Every section is optional; missing keys fall back to defaults.

[store]
db_path = "conduit.db"
# in_memory = false

[registry]
# Closed capability vocabulary. Empty accepts any well-formed tag.
# allowed_capabilities = ["pdf_extraction", "knowledge_store"]

[conversations]
max_idle_secs = 1800
sweep_interval_secs = 60

[negotiation]
infer_from_sample = true
allow_coercion = true

[router]
max_retries = 3
retry_backoff_ms = 50
# renegotiate_on_retry = true
# breaker_threshold = 5
# breaker_open_secs = 60

[learning]
# seed = 12648430

[learning.bandit]
policy = "epsilon_greedy"   # or "ucb"
# epsilon = 0.2
# epsilon_min = 0.01
# epsilon_decay = 0.95

[learning.reward]
# completion = 1.0
# failure = -1.0
# latency_budget_ms = 2000
# floor = -2.0

[logging]
level = "info"
format = "pretty"   # or "json"
"#;

pub(super) fn cmd_init(local: bool) -> conduit_core::Result<()> {
    let dir = if local {
        std::env::current_dir()?
    } else {
        ConfigLoader::default_dir()
    };

    std::fs::create_dir_all(&dir)?;
    let config_path = dir.join("conduit.toml");

    if config_path.exists() {
        println!("{} already exists", config_path.display());
        return Ok(());
    }

    // pin the store next to the config file
    let starter = STARTER_CONFIG.replace(
        "db_path = \"conduit.db\"",
        &format!(
            "db_path = {}",
            toml::Value::String(dir.join("conduit.db").display().to_string())
        ),
    );
    std::fs::write(&config_path, starter)?;
    println!("Created {}", config_path.display());
    println!("   Edit it, then run 'conduit status' to check the store.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starter_config_parses() {
        let config = ConfigLoader::from_toml(STARTER_CONFIG).unwrap();
        assert_eq!(config.router.max_retries, 3);
        assert_eq!(config.logging.format, "pretty");
    }
}
