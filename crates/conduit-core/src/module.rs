use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{ConduitError, Result};
use crate::schema::Schema;

/// Capability/schema metadata for one registered module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique key in the registry.
    pub name: String,
    /// Closed set of capability tags, e.g. "pdf_extraction", "knowledge_store".
    pub capabilities: BTreeSet<String>,
    pub input_schema: Schema,
    pub output_schema: Schema,
    /// Flipped by health checks and the router's circuit breaker.
    #[serde(default = "default_true")]
    pub healthy: bool,
    /// Resource envelope the module accepts.
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Bumped on every re-registration.
    #[serde(default)]
    pub version: u64,
}

impl ModuleDescriptor {
    pub fn new(
        name: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        input_schema: Schema,
        output_schema: Schema,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            input_schema,
            output_schema,
            healthy: true,
            limits: ResourceLimits::default(),
            version: 0,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Whether both declared schemas match `other`'s exactly.
    pub fn same_schemas(&self, other: &ModuleDescriptor) -> bool {
        self.input_schema.fingerprint() == other.input_schema.fingerprint()
            && self.output_schema.fingerprint() == other.output_schema.fingerprint()
    }
}

fn default_true() -> bool {
    true
}

/// Inclusive numeric range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Clamp into the range. NaN maps to `min`.
    pub fn clamp(&self, value: f64) -> f64 {
        if value.is_nan() {
            return self.min;
        }
        value.clamp(self.min, self.max)
    }

    /// Map a fraction in [0, 1] onto the range.
    pub fn lerp(&self, fraction: f64) -> f64 {
        self.clamp(self.min + fraction.clamp(0.0, 1.0) * (self.max - self.min))
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }

    fn is_whole(&self) -> bool {
        self.min.fract() == 0.0 && self.max.fract() == 0.0
    }
}

/// Per-module resource envelope. Allocations are always clipped into it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Fraction of CPU, within [0, 1].
    pub cpu_share: Bounds,
    /// Fraction of memory, within [0, 1].
    pub memory_share: Bounds,
    /// Dispatch deadline in milliseconds (whole numbers).
    pub timeout_ms: Bounds,
    /// Scheduling priority, 0 (lowest) to 10 (highest).
    pub priority: Bounds,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_share: Bounds::new(0.05, 1.0),
            memory_share: Bounds::new(0.05, 1.0),
            timeout_ms: Bounds::new(100.0, 30_000.0),
            priority: Bounds::new(0.0, 10.0),
        }
    }
}

impl ResourceLimits {
    /// Check the envelope is usable; called at registration time.
    pub fn validate(&self, module: &str) -> Result<()> {
        let invalid = |reason: String| ConduitError::InvalidRegistration {
            module: module.to_string(),
            reason,
        };
        for (name, b) in [
            ("cpu_share", self.cpu_share),
            ("memory_share", self.memory_share),
            ("timeout_ms", self.timeout_ms),
            ("priority", self.priority),
        ] {
            if !b.is_valid() {
                return Err(invalid(format!("{name} bounds [{}, {}] are invalid", b.min, b.max)));
            }
        }
        for (name, b) in [("cpu_share", self.cpu_share), ("memory_share", self.memory_share)] {
            if b.min < 0.0 || b.max > 1.0 {
                return Err(invalid(format!("{name} must lie within [0, 1]")));
            }
        }
        for (name, b) in [("timeout_ms", self.timeout_ms), ("priority", self.priority)] {
            if !b.is_whole() || b.min < 0.0 {
                return Err(invalid(format!("{name} bounds must be non-negative whole numbers")));
            }
        }
        if self.timeout_ms.min < 1.0 {
            return Err(invalid("timeout_ms minimum must be at least 1".into()));
        }
        if self.priority.max > u8::MAX as f64 {
            return Err(invalid("priority maximum exceeds 255".into()));
        }
        Ok(())
    }
}

/// Resources granted to a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub cpu_share: f64,
    pub memory_share: f64,
    pub timeout_ms: u64,
    pub priority: u8,
}

impl Allocation {
    /// Build an allocation from raw values, clipped to `limits`.
    pub fn clipped(cpu_share: f64, memory_share: f64, timeout_ms: f64, priority: f64, limits: &ResourceLimits) -> Self {
        Self {
            cpu_share: limits.cpu_share.clamp(cpu_share),
            memory_share: limits.memory_share.clamp(memory_share),
            timeout_ms: limits.timeout_ms.clamp(timeout_ms).round() as u64,
            priority: limits.priority.clamp(priority).round() as u8,
        }
    }

    pub fn within(&self, limits: &ResourceLimits) -> bool {
        limits.cpu_share.contains(self.cpu_share)
            && limits.memory_share.contains(self.memory_share)
            && limits.timeout_ms.contains(self.timeout_ms as f64)
            && limits.priority.contains(self.priority as f64)
    }
}
