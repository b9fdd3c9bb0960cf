//! # conduit-runtime
//!
//! The hub runtime: module registry, schema negotiation, conversation
//! lifecycle and the message router that ties them to the learners.
//!
//! ## Architecture
//!
//! ```text
//!        RouteRequest
//!             │
//!             ▼
//!     ┌───────────────┐   select / allocate / recover   ┌────────────────┐
//!     │ MessageRouter │ ◄─────────────────────────────► │ DecisionEngine │
//!     └───────┬───────┘          observe + record       └────────────────┘
//!             │
//!   ┌─────────┼─────────────┬──────────────────┐
//!   ▼         ▼             ▼                  ▼
//! Registry  Negotiator  Conversations   ModuleAdapter
//!                           │
//!                           ▼
//!                   ConversationStore
//! ```
//!
//! [`Hub`] owns one instance of everything plus the inactivity sweeper.

pub mod adapter;
pub mod conversation;
pub mod hub;
pub mod mock;
pub mod negotiator;
pub mod pipeline;
pub mod registry;
pub mod router;
pub mod sweeper;

pub use adapter::{Invocation, ModuleAdapter};
pub use conversation::ConversationManager;
pub use hub::Hub;
pub use mock::{MockAdapter, MockReply};
pub use negotiator::SchemaNegotiator;
pub use pipeline::{PipelineReport, PipelineSpec, PipelineStep};
pub use registry::{ModuleRegistry, RegistrySnapshot};
pub use router::{MessageRouter, RouteError, RouteOutcome, RouteRequest};
pub use sweeper::spawn_sweeper;
