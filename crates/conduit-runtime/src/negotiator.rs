use conduit_config::NegotiationConfig;
use conduit_core::{
    Compatibility, ConduitError, EventBus, FieldMapping, FieldSpec, HubEvent, Result, Schema, SchemaContract,
    Transform,
};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::registry::ModuleRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ContractKey {
    source: String,
    target: String,
    source_fingerprint: String,
    target_fingerprint: String,
}

/// Computes and caches schema contracts between module pairs.
///
/// Cache entries are keyed by both schema fingerprints, so a re-registered
/// schema can never be served a stale contract. Contracts built from an
/// inferred sample schema are never cached.
pub struct SchemaNegotiator {
    registry: Arc<ModuleRegistry>,
    config: NegotiationConfig,
    cache: DashMap<ContractKey, Arc<SchemaContract>>,
    events: EventBus,
}

impl SchemaNegotiator {
    pub fn new(registry: Arc<ModuleRegistry>, config: NegotiationConfig, events: EventBus) -> Self {
        Self {
            registry,
            config,
            cache: DashMap::new(),
            events,
        }
    }

    /// Contract for `source`'s output flowing into `target`'s input.
    ///
    /// A target that declares no input schema gets a pass-through contract.
    /// Otherwise, when the source declares no output schema or the declared
    /// schemas share nothing, a schema inferred from `sample` is tried.
    /// Contracts from inferred schemas are rebuilt on every call.
    pub fn negotiate(&self, source: &str, target: &str, sample: Option<&Value>) -> Result<Arc<SchemaContract>> {
        let src = self.registry.require(source)?;
        let tgt = self.registry.require(target)?;

        let key = ContractKey {
            source: source.to_string(),
            target: target.to_string(),
            source_fingerprint: src.output_schema.fingerprint(),
            target_fingerprint: tgt.input_schema.fingerprint(),
        };
        if let Some(hit) = self.cache.get(&key) {
            return Ok(Arc::clone(hit.value()));
        }

        // A target without an input schema accepts any payload as sent.
        if tgt.input_schema.is_empty() {
            let contract = Arc::new(self.build(source, target, &src.output_schema, &tgt.input_schema, false));
            self.cache.insert(key, Arc::clone(&contract));
            self.announce(&contract);
            return Ok(contract);
        }

        let declared = if src.output_schema.is_empty() {
            None
        } else {
            let contract = self.build(source, target, &src.output_schema, &tgt.input_schema, false);
            (!contract.mappings.is_empty()).then_some(contract)
        };

        if let Some(contract) = declared {
            let contract = Arc::new(contract);
            self.cache.insert(key, Arc::clone(&contract));
            self.announce(&contract);
            return Ok(contract);
        }

        if self.config.infer_from_sample
            && let Some(sample) = sample
        {
            let inferred = Schema::infer(sample);
            let contract = self.build(source, target, &inferred, &tgt.input_schema, true);
            if !contract.mappings.is_empty() {
                let contract = Arc::new(contract);
                self.announce(&contract);
                return Ok(contract);
            }
        }

        let reason = if src.output_schema.is_empty() {
            "source declares no output schema and no usable sample was given".to_string()
        } else {
            "no shared fields between output and input schema".to_string()
        };
        Err(ConduitError::SchemaIncompatible {
            from_module: source.to_string(),
            to_module: target.to_string(),
            reason,
        })
    }

    /// Drop every cached contract that references `module`. Returns how many.
    pub fn invalidate_module(&self, module: &str) -> usize {
        let before = self.cache.len();
        self.cache.retain(|key, _| key.source != module && key.target != module);
        let removed = before - self.cache.len();
        if removed > 0 {
            debug!(module, removed, "invalidated cached contracts");
        }
        removed
    }

    pub fn invalidate_pair(&self, source: &str, target: &str) {
        self.cache.retain(|key, _| !(key.source == source && key.target == target));
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn announce(&self, contract: &SchemaContract) {
        debug!(
            source = %contract.source_module,
            target = %contract.target_module,
            fields = contract.mappings.len(),
            inferred = contract.inferred,
            "schema contract negotiated"
        );
        self.events.publish(HubEvent::ContractNegotiated {
            source: contract.source_module.clone(),
            target: contract.target_module.clone(),
            inferred: contract.inferred,
        });
    }

    fn build(&self, source: &str, target: &str, output: &Schema, input: &Schema, inferred: bool) -> SchemaContract {
        let pass_through = input.is_empty();
        let (mappings, transforms, unfilled) = if pass_through {
            forward_all(output)
        } else {
            intersect(output, input, self.config.allow_coercion)
        };
        SchemaContract {
            source_module: source.to_string(),
            target_module: target.to_string(),
            source_fingerprint: output.fingerprint(),
            target_fingerprint: input.fingerprint(),
            mappings,
            transforms,
            unfilled,
            source_field_count: output.len(),
            inferred,
            pass_through,
        }
    }
}

/// A target without a declared input schema takes the source output as-is.
fn forward_all(output: &Schema) -> (Vec<FieldMapping>, Vec<Transform>, Vec<String>) {
    let mappings = output
        .fields
        .iter()
        .map(|(name, spec)| FieldMapping {
            source: name.clone(),
            target: name.clone(),
            source_type: spec.ty.clone(),
            target_type: spec.ty.clone(),
            coerced: false,
        })
        .collect();
    (mappings, Vec::new(), Vec::new())
}

/// Pair source fields with target fields: exact names first, then target
/// aliases. Each source field feeds at most one target field.
fn intersect(output: &Schema, input: &Schema, allow_coercion: bool) -> (Vec<FieldMapping>, Vec<Transform>, Vec<String>) {
    // source name -> (target name, compatibility, target spec)
    let mut claimed: BTreeMap<&str, (&str, Compatibility, &FieldSpec)> = BTreeMap::new();
    let mut filled: Vec<&str> = Vec::new();

    for (tname, tspec) in &input.fields {
        if let Some(sspec) = output.fields.get(tname) {
            let compat = sspec.ty.compatibility(&tspec.ty, allow_coercion);
            if compat != Compatibility::Incompatible {
                claimed.insert(tname.as_str(), (tname.as_str(), compat, tspec));
                filled.push(tname.as_str());
            }
        }
    }
    for (tname, tspec) in &input.fields {
        if filled.contains(&tname.as_str()) {
            continue;
        }
        for alias in &tspec.aliases {
            let Some(sspec) = output.fields.get(alias) else {
                continue;
            };
            if claimed.contains_key(alias.as_str()) {
                continue;
            }
            let compat = sspec.ty.compatibility(&tspec.ty, allow_coercion);
            if compat != Compatibility::Incompatible {
                claimed.insert(alias.as_str(), (tname.as_str(), compat, tspec));
                filled.push(tname.as_str());
                break;
            }
        }
    }

    let mut mappings = Vec::new();
    let mut transforms = Vec::new();
    for (sname, sspec) in &output.fields {
        let Some((tname, compat, tspec)) = claimed.get(sname.as_str()) else {
            transforms.push(Transform::Drop { field: sname.clone() });
            continue;
        };
        let coerced = *compat == Compatibility::Coerce;
        if sname != tname {
            transforms.push(Transform::Rename {
                from: sname.clone(),
                to: tname.to_string(),
            });
        }
        if coerced {
            transforms.push(Transform::Coerce {
                field: tname.to_string(),
                from: sspec.ty.clone(),
                to: tspec.ty.clone(),
            });
        }
        mappings.push(FieldMapping {
            source: sname.clone(),
            target: tname.to_string(),
            source_type: sspec.ty.clone(),
            target_type: tspec.ty.clone(),
            coerced,
        });
    }

    let unfilled = input
        .fields
        .iter()
        .filter(|(name, spec)| spec.required && !filled.contains(&name.as_str()))
        .map(|(name, _)| name.clone())
        .collect();
    (mappings, transforms, unfilled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::FieldType;

    #[test]
    fn test_alias_becomes_rename() {
        let out = Schema::new().field("text", FieldType::String).field("pages", FieldType::Integer);
        let input = Schema::new().field("content", FieldType::String).alias("content", "text");
        let (mappings, transforms, unfilled) = intersect(&out, &input, true);
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].target, "content");
        assert!(transforms.contains(&Transform::Rename {
            from: "text".into(),
            to: "content".into()
        }));
        assert!(transforms.contains(&Transform::Drop { field: "pages".into() }));
        assert!(unfilled.is_empty());
    }

    #[test]
    fn test_coercion_respects_flag() {
        let out = Schema::new().field("n", FieldType::Integer);
        let input = Schema::new().field("n", FieldType::Number);
        let (mappings, _, _) = intersect(&out, &input, true);
        assert!(mappings[0].coerced);
        let (mappings, _, unfilled) = intersect(&out, &input, false);
        assert!(mappings.is_empty());
        assert_eq!(unfilled, vec!["n".to_string()]);
    }
}
