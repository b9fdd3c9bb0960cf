use arc_swap::ArcSwap;
use conduit_config::RegistryConfig;
use conduit_core::{ConduitError, EventBus, HubEvent, ModuleDescriptor, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Immutable view of the registry. Readers hold one of these for as long as
/// they like; writers publish a fresh one.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    modules: BTreeMap<String, Arc<ModuleDescriptor>>,
    /// capability tag -> provider names
    providers: BTreeMap<String, BTreeSet<String>>,
}

impl RegistrySnapshot {
    fn from_modules(modules: BTreeMap<String, Arc<ModuleDescriptor>>) -> Self {
        let mut providers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (name, desc) in &modules {
            for cap in &desc.capabilities {
                providers.entry(cap.clone()).or_default().insert(name.clone());
            }
        }
        Self { modules, providers }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModuleDescriptor>> {
        self.modules.get(name).cloned()
    }

    pub fn modules(&self) -> impl Iterator<Item = &Arc<ModuleDescriptor>> {
        self.modules.values()
    }

    /// Every provider of `capability`, healthy or not, ordered by name.
    pub fn providers(&self, capability: &str) -> Vec<Arc<ModuleDescriptor>> {
        self.providers
            .get(capability)
            .into_iter()
            .flatten()
            .filter_map(|name| self.modules.get(name).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Capability/schema catalog of every module attached to the hub.
///
/// Lookups read a lock-free snapshot. Mutations are serialized behind a
/// writer lock and swap in a new snapshot, so a reader never sees a
/// half-applied registration.
pub struct ModuleRegistry {
    current: ArcSwap<RegistrySnapshot>,
    writer: Mutex<()>,
    allowed: BTreeSet<String>,
    events: EventBus,
}

impl ModuleRegistry {
    pub fn new(config: &RegistryConfig, events: EventBus) -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistrySnapshot::default()),
            writer: Mutex::new(()),
            allowed: config.allowed_capabilities.iter().cloned().collect(),
            events,
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    /// Register a module. Returns `true` when the registry changed.
    ///
    /// Registering a name that already exists with different schemas fails
    /// with `RegistrationConflict` unless `reregister` is set. Re-registering
    /// an identical descriptor is a no-op.
    pub fn register(&self, descriptor: ModuleDescriptor, reregister: bool) -> Result<bool> {
        self.validate(&descriptor)?;

        let _guard = self.writer.lock();
        let snapshot = self.current.load_full();
        let mut descriptor = descriptor;

        if let Some(existing) = snapshot.modules.get(&descriptor.name) {
            if !existing.same_schemas(&descriptor) && !reregister {
                return Err(ConduitError::RegistrationConflict {
                    module: descriptor.name.clone(),
                    reason: "already registered with a different schema".into(),
                });
            }
            if existing.same_schemas(&descriptor)
                && existing.capabilities == descriptor.capabilities
                && existing.limits == descriptor.limits
            {
                debug!(module = %descriptor.name, "identical re-registration ignored");
                return Ok(false);
            }
            descriptor.version = existing.version + 1;
            descriptor.healthy = existing.healthy;
        }

        let name = descriptor.name.clone();
        let version = descriptor.version;
        let mut modules = snapshot.modules.clone();
        modules.insert(name.clone(), Arc::new(descriptor));
        self.current.store(Arc::new(RegistrySnapshot::from_modules(modules)));

        info!(module = %name, version, "module registered");
        self.events.publish(HubEvent::ModuleRegistered { module: name, version });
        Ok(true)
    }

    pub fn deregister(&self, name: &str) -> Result<Arc<ModuleDescriptor>> {
        let _guard = self.writer.lock();
        let snapshot = self.current.load_full();
        let mut modules = snapshot.modules.clone();
        let removed = modules
            .remove(name)
            .ok_or_else(|| ConduitError::UnknownModule(name.to_string()))?;
        self.current.store(Arc::new(RegistrySnapshot::from_modules(modules)));

        info!(module = %name, "module deregistered");
        self.events.publish(HubEvent::ModuleDeregistered { module: name.to_string() });
        Ok(removed)
    }

    /// Flip a module's health flag. Returns `true` if it actually changed.
    pub fn set_health(&self, name: &str, healthy: bool) -> Result<bool> {
        let _guard = self.writer.lock();
        let snapshot = self.current.load_full();
        let existing = snapshot
            .modules
            .get(name)
            .ok_or_else(|| ConduitError::UnknownModule(name.to_string()))?;
        if existing.healthy == healthy {
            return Ok(false);
        }

        let mut updated = ModuleDescriptor::clone(existing);
        updated.healthy = healthy;
        let mut modules = snapshot.modules.clone();
        modules.insert(name.to_string(), Arc::new(updated));
        self.current.store(Arc::new(RegistrySnapshot::from_modules(modules)));

        if healthy {
            info!(module = %name, "module healthy again");
        } else {
            warn!(module = %name, "module marked unhealthy");
        }
        self.events.publish(HubEvent::ModuleHealthChanged {
            module: name.to_string(),
            healthy,
        });
        Ok(true)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModuleDescriptor>> {
        self.current.load().get(name)
    }

    pub fn require(&self, name: &str) -> Result<Arc<ModuleDescriptor>> {
        self.get(name).ok_or_else(|| ConduitError::UnknownModule(name.to_string()))
    }

    /// Healthy providers of `capability`, ordered by name.
    pub fn available(&self, capability: &str) -> Vec<Arc<ModuleDescriptor>> {
        let mut providers = self.current.load().providers(capability);
        providers.retain(|d| d.healthy);
        providers
    }

    pub fn list(&self) -> Vec<Arc<ModuleDescriptor>> {
        self.current.load().modules().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    fn validate(&self, descriptor: &ModuleDescriptor) -> Result<()> {
        let invalid = |reason: String| ConduitError::InvalidRegistration {
            module: descriptor.name.clone(),
            reason,
        };
        if descriptor.name.trim().is_empty() {
            return Err(invalid("module name is empty".into()));
        }
        if descriptor.capabilities.is_empty() {
            return Err(invalid("at least one capability tag is required".into()));
        }
        for cap in &descriptor.capabilities {
            if !is_valid_tag(cap) {
                return Err(invalid(format!(
                    "capability '{cap}' must be lowercase letters, digits, '_', '-' or '.'"
                )));
            }
            if !self.allowed.is_empty() && !self.allowed.contains(cap) {
                return Err(invalid(format!("capability '{cap}' is not in the allowed set")));
            }
        }
        descriptor.limits.validate(&descriptor.name)
    }
}

fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.'))
}
