//! # conduit-core
//!
//! Core types and primitives for the Conduit module-communication hub.
//! This crate defines the shared vocabulary used by every other crate in the
//! workspace: conversations and messages, module descriptors, schemas and
//! negotiated contracts, learning episodes, the event bus, and the error
//! taxonomy.

pub mod episode;
pub mod error;
pub mod event;
pub mod module;
pub mod schema;
pub mod types;

pub use episode::{DecisionType, Episode};
pub use error::{AdapterError, ConduitError, Result};
pub use event::{EventBus, HubEvent};
pub use module::{Allocation, Bounds, ModuleDescriptor, ResourceLimits};
pub use schema::{Compatibility, FieldMapping, FieldSpec, FieldType, Schema, SchemaContract, Transform};
pub use types::*;
