use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::ConduitConfig;

/// Loads and reloads the Conduit configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<ConduitConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > CONDUIT_CONFIG env > ~/.conduit/conduit.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("CONDUIT_CONFIG") {
            return PathBuf::from(p);
        }
        Self::default_dir().join("conduit.toml")
    }

    /// `~/.conduit`, or `./.conduit` when there is no home directory.
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".conduit")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> conduit_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            ConduitConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Parse a config from a TOML string. Env overrides are not applied.
    pub fn from_toml(raw: &str) -> conduit_core::Result<ConduitConfig> {
        let config = toml::from_str::<ConduitConfig>(raw)
            .map_err(|e| conduit_core::ConduitError::Config(format!("failed to parse config: {e}")))?;
        Self::check(&config)?;
        Ok(config)
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> ConduitConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<ConduitConfig>> {
        Arc::clone(&self.config)
    }

    /// Path the config was (or would have been) read from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Reload the config from disk. A file that fails to parse or validate
    /// leaves the current config in place.
    pub fn reload(&self) -> conduit_core::Result<()> {
        if !self.config_path.exists() {
            return Err(conduit_core::ConduitError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::parse_file(&self.config_path)?);
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Apply env var overrides (CONDUIT_LOG_LEVEL, CONDUIT_DB_PATH, etc.)
    fn apply_env_overrides(config: ConduitConfig) -> ConduitConfig {
        Self::apply_overrides_from(config, |key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides_from<F>(mut config: ConduitConfig, lookup: F) -> ConduitConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CONDUIT_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Some(v) = lookup("CONDUIT_DB_PATH") {
            config.store.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CONDUIT_MAX_RETRIES") {
            match v.parse::<u32>() {
                Ok(n) => config.router.max_retries = n,
                Err(_) => warn!(value = %v, "ignoring invalid CONDUIT_MAX_RETRIES"),
            }
        }
        if let Some(v) = lookup("CONDUIT_SEED") {
            match v.parse::<u64>() {
                Ok(seed) => config.learning.seed = seed,
                Err(_) => warn!(value = %v, "ignoring invalid CONDUIT_SEED"),
            }
        }
        config
    }

    fn parse_file(path: &Path) -> conduit_core::Result<ConduitConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<ConduitConfig>(&raw).map_err(|e| {
            conduit_core::ConduitError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Validate: log warnings, fail on errors.
    fn check(config: &ConduitConfig) -> conduit_core::Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(conduit_core::ConduitError::Config(e)),
        }
    }
}
