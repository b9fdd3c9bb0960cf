use conduit_config::ConduitConfig;
use conduit_core::{ConduitError, ConversationId, EventBus, HubEvent, ModuleDescriptor, Result};
use conduit_learning::DecisionEngine;
use conduit_store::{ConversationStore, EpisodeLog, MemoryStore, SqliteStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::ModuleAdapter;
use crate::conversation::ConversationManager;
use crate::negotiator::SchemaNegotiator;
use crate::pipeline::{PipelineReport, PipelineSpec};
use crate::registry::ModuleRegistry;
use crate::router::{MessageRouter, RouteError, RouteOutcome, RouteRequest};
use crate::sweeper::spawn_sweeper;

/// One self-contained hub instance.
///
/// Owns every component plus the background sweeper. Nothing is global, so
/// several hubs can run side by side in one process.
pub struct Hub {
    config: ConduitConfig,
    events: EventBus,
    registry: Arc<ModuleRegistry>,
    negotiator: Arc<SchemaNegotiator>,
    conversations: Arc<ConversationManager>,
    engine: Arc<DecisionEngine>,
    router: Arc<MessageRouter>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Hub {
    /// Open the hub on the configured SQLite file (or in memory when
    /// `store.in_memory` is set), restore live conversations, and warm-start
    /// the learners from the experience log.
    pub async fn open(config: ConduitConfig) -> Result<Self> {
        if config.store.in_memory {
            return Self::in_memory(config).await;
        }
        if let Some(parent) = config.store.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let store = Arc::new(SqliteStore::open(&config.store.db_path)?);
        info!(path = %config.store.db_path.display(), "opened hub store");
        Self::with_store(config, store).await
    }

    pub async fn in_memory(config: ConduitConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new())).await
    }

    pub async fn with_store<S>(config: ConduitConfig, store: Arc<S>) -> Result<Self>
    where
        S: ConversationStore + EpisodeLog + 'static,
    {
        for warning in config.validate().map_err(ConduitError::Config)? {
            warn!("{warning}");
        }

        let events = EventBus::default();
        let conversation_store: Arc<dyn ConversationStore> = store.clone();
        let episode_log: Arc<dyn EpisodeLog> = store;

        let registry = Arc::new(ModuleRegistry::new(&config.registry, events.clone()));
        let negotiator = Arc::new(SchemaNegotiator::new(
            Arc::clone(&registry),
            config.negotiation.clone(),
            events.clone(),
        ));
        let conversations = Arc::new(ConversationManager::new(
            conversation_store,
            Arc::clone(&registry),
            events.clone(),
        ));
        let engine = Arc::new(DecisionEngine::new(
            &config.learning,
            config.router.max_retries,
            episode_log,
        ));
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            Arc::clone(&negotiator),
            Arc::clone(&conversations),
            Arc::clone(&engine),
            config.router.clone(),
            events.clone(),
        ));

        conversations.restore_active().await?;
        engine.replay_all().await?;

        let cancel = CancellationToken::new();
        let sweeper = spawn_sweeper(
            Arc::clone(&conversations),
            Duration::from_secs(config.conversations.sweep_interval_secs),
            Duration::from_secs(config.conversations.max_idle_secs),
            cancel.child_token(),
        );

        Ok(Self {
            config,
            events,
            registry,
            negotiator,
            conversations,
            engine,
            router,
            cancel,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Register a module together with the adapter that serves it.
    pub fn register(
        &self,
        descriptor: ModuleDescriptor,
        adapter: Arc<dyn ModuleAdapter>,
        reregister: bool,
    ) -> Result<bool> {
        if adapter.name() != descriptor.name {
            return Err(ConduitError::InvalidRegistration {
                module: descriptor.name,
                reason: format!("adapter serves '{}'", adapter.name()),
            });
        }
        let changed = self.register_descriptor(descriptor, reregister)?;
        self.router.attach(adapter);
        Ok(changed)
    }

    /// Register metadata only; dispatches fail until an adapter is attached.
    pub fn register_descriptor(&self, descriptor: ModuleDescriptor, reregister: bool) -> Result<bool> {
        let name = descriptor.name.clone();
        let changed = self.registry.register(descriptor, reregister)?;
        if changed {
            self.negotiator.invalidate_module(&name);
        }
        Ok(changed)
    }

    pub fn deregister(&self, name: &str) -> Result<()> {
        self.registry.deregister(name)?;
        self.negotiator.invalidate_module(name);
        self.router.detach(name);
        Ok(())
    }

    pub async fn route(&self, request: RouteRequest) -> std::result::Result<RouteOutcome, RouteError> {
        self.router.route(request).await
    }

    pub async fn run_pipeline(
        &self,
        spec: &PipelineSpec,
        origin: &str,
    ) -> std::result::Result<PipelineReport, RouteError> {
        self.router.run_pipeline(spec, origin).await
    }

    pub async fn refresh_health(&self) -> Vec<(String, bool)> {
        self.router.refresh_health().await
    }

    /// Run one inactivity sweep now with the configured idle limit.
    pub async fn sweep(&self) -> Result<Vec<ConversationId>> {
        self.conversations
            .cleanup_inactive(Duration::from_secs(self.config.conversations.max_idle_secs))
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ConduitConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn negotiator(&self) -> &Arc<SchemaNegotiator> {
        &self.negotiator
    }

    pub fn conversations(&self) -> &Arc<ConversationManager> {
        &self.conversations
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Stop the sweeper and wait for it to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "sweeper task ended abnormally");
        }
        info!("hub shut down");
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
