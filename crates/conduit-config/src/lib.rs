//! # conduit-config
//!
//! Configuration system for the Conduit hub. Reads from `conduit.toml` and
//! environment variables, in that precedence order.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::ConduitConfig;
pub use schema::{
    AllocationConfig, BanditConfig, ConfigWarning, ConversationConfig, ExplorationPolicy, LearningConfig,
    LoggingConfig, NegotiationConfig, RecoveryConfig, RegistryConfig, RewardConfig, RouterConfig, SequencingConfig,
    StoreConfig, WarningSeverity,
};
