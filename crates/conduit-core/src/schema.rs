//! Typed, versioned schema definitions and the negotiated contracts built
//! from them.
//!
//! Schemas are validated at the boundary (registration and negotiation), so
//! type mismatches surface before a payload ever reaches a module.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Structural type of a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    Any,
    Bool,
    Integer,
    Number,
    String,
    Array { items: Box<FieldType> },
    Object { fields: BTreeMap<String, FieldSpec> },
}

/// How a source field type relates to a target field type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Exact,
    /// Usable after a lossless or widening conversion.
    Coerce,
    Incompatible,
}

impl FieldType {
    pub fn array(items: FieldType) -> Self {
        FieldType::Array { items: Box::new(items) }
    }

    pub fn object(schema: Schema) -> Self {
        FieldType::Object { fields: schema.fields }
    }

    fn is_scalar(&self) -> bool {
        matches!(self, FieldType::Bool | FieldType::Integer | FieldType::Number | FieldType::String)
    }

    /// Compatibility of a value of type `self` flowing into a slot of type `target`.
    pub fn compatibility(&self, target: &FieldType, allow_coercion: bool) -> Compatibility {
        use FieldType::*;
        let coerce = if allow_coercion {
            Compatibility::Coerce
        } else {
            Compatibility::Incompatible
        };
        match (self, target) {
            (Any, _) | (_, Any) => Compatibility::Exact,
            (Integer, Number) => coerce,
            (s, String) if s.is_scalar() && *s != String => coerce,
            (Array { items: a }, Array { items: b }) => a.compatibility(b, allow_coercion),
            (Object { fields: a }, Object { fields: b }) => {
                if a == b {
                    return Compatibility::Exact;
                }
                // a partial overlap is reshaped field by field, not converted
                let overlap = a.iter().any(|(name, spec)| {
                    b.get(name).is_some_and(|t| {
                        spec.ty.compatibility(&t.ty, allow_coercion) != Compatibility::Incompatible
                    })
                });
                if overlap {
                    Compatibility::Coerce
                } else {
                    Compatibility::Incompatible
                }
            }
            (a, b) if a == b => Compatibility::Exact,
            _ => Compatibility::Incompatible,
        }
    }

    /// Structural type of a sample value.
    pub fn infer(value: &Value) -> FieldType {
        match value {
            Value::Null => FieldType::Any,
            Value::Bool(_) => FieldType::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => FieldType::Integer,
            Value::Number(_) => FieldType::Number,
            Value::String(_) => FieldType::String,
            Value::Array(items) => {
                let mut types = items.iter().map(FieldType::infer);
                let first = types.next().unwrap_or(FieldType::Any);
                if types.all(|t| t == first) {
                    FieldType::array(first)
                } else {
                    FieldType::array(FieldType::Any)
                }
            }
            Value::Object(map) => FieldType::Object {
                fields: map
                    .iter()
                    .map(|(k, v)| (k.clone(), FieldSpec::required(FieldType::infer(v))))
                    .collect(),
            },
        }
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(flatten)]
    pub ty: FieldType,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Alternative source names this (input) field accepts, e.g. "text" for "content".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

fn default_required() -> bool {
    true
}

impl FieldSpec {
    pub fn required(ty: FieldType) -> Self {
        Self { ty, required: true, aliases: Vec::new() }
    }

    pub fn optional(ty: FieldType) -> Self {
        Self { ty, required: false, aliases: Vec::new() }
    }
}

/// A module's declared input or output schema.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

/// Field name used when a non-object sample is typed.
pub const SCALAR_FIELD: &str = "value";

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required field.
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.insert(name.into(), FieldSpec::required(ty));
        self
    }

    /// Add an optional field.
    pub fn optional(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.insert(name.into(), FieldSpec::optional(ty));
        self
    }

    /// Declare that input field `name` also accepts a source field called `alias`.
    pub fn alias(mut self, name: &str, alias: impl Into<String>) -> Self {
        if let Some(spec) = self.fields.get_mut(name) {
            spec.aliases.push(alias.into());
            spec.aliases.sort();
            spec.aliases.dedup();
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Stable content hash of the schema. Changes whenever a field, type,
    /// requirement flag, or alias changes.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let hash = blake3::hash(&canonical);
        hash.to_hex().as_str()[..16].to_string()
    }

    /// Structurally type a sample payload. Objects yield one field per key;
    /// anything else is typed as a single `value` field.
    pub fn infer(sample: &Value) -> Schema {
        match FieldType::infer(sample) {
            FieldType::Object { fields } => Schema { fields },
            other => Schema::new().field(SCALAR_FIELD, other),
        }
    }
}

/// A retained source field and where it lands in the target input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: String,
    pub target: String,
    pub source_type: FieldType,
    pub target_type: FieldType,
    pub coerced: bool,
}

/// Rule a module adapter applies to a payload before invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transform {
    Drop { field: String },
    Rename { from: String, to: String },
    Coerce { field: String, from: FieldType, to: FieldType },
}

/// Negotiated pairing of a source output schema with a target input schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContract {
    pub source_module: String,
    pub target_module: String,
    pub source_fingerprint: String,
    pub target_fingerprint: String,
    /// Retained fields, ordered by source field name.
    pub mappings: Vec<FieldMapping>,
    /// Empty when the intersection equals both sides.
    pub transforms: Vec<Transform>,
    /// Target input fields no source field supplies.
    pub unfilled: Vec<String>,
    /// Number of fields on the source side the contract was computed from.
    pub source_field_count: usize,
    /// Built from a typed sample instead of the declared output schema.
    pub inferred: bool,
    /// The target declares no input schema; payloads are forwarded untouched.
    #[serde(default)]
    pub pass_through: bool,
}

impl SchemaContract {
    /// No transformation needed on either side.
    pub fn is_identity(&self) -> bool {
        self.pass_through || (self.transforms.is_empty() && self.unfilled.is_empty())
    }

    /// Fraction of source fields preserved end-to-end.
    pub fn preserved_ratio(&self) -> f64 {
        if self.source_field_count == 0 {
            return 1.0;
        }
        self.mappings.len() as f64 / self.source_field_count as f64
    }

    /// Canonical byte form, identical for identical contracts.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn references(&self, module: &str) -> bool {
        self.source_module == module || self.target_module == module
    }

    /// Reshape a source payload into the target's input form: unmapped fields
    /// are dropped, renamed fields moved, coercions applied. A pass-through
    /// contract returns the payload unchanged, whatever its shape.
    pub fn apply(&self, payload: &Value) -> Value {
        if self.pass_through {
            return payload.clone();
        }
        let mut out = Map::new();
        match payload {
            Value::Object(obj) => {
                for m in &self.mappings {
                    if let Some(v) = obj.get(&m.source) {
                        out.insert(m.target.clone(), coerce_value(v, &m.target_type));
                    }
                }
            }
            scalar => {
                if let Some(m) = self.mappings.iter().find(|m| m.source == SCALAR_FIELD) {
                    out.insert(m.target.clone(), coerce_value(scalar, &m.target_type));
                }
            }
        }
        Value::Object(out)
    }
}

fn coerce_value(value: &Value, target: &FieldType) -> Value {
    match (target, value) {
        (FieldType::Number, Value::Number(n)) => n
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        (FieldType::String, Value::Bool(b)) => Value::String(b.to_string()),
        (FieldType::String, Value::Number(n)) => Value::String(n.to_string()),
        (FieldType::Array { items }, Value::Array(values)) => {
            Value::Array(values.iter().map(|v| coerce_value(v, items)).collect())
        }
        (FieldType::Object { fields }, Value::Object(obj)) => Value::Object(
            obj.iter()
                .filter_map(|(k, v)| fields.get(k).map(|spec| (k.clone(), coerce_value(v, &spec.ty))))
                .collect(),
        ),
        _ => value.clone(),
    }
}
