//! # conduit-store
//!
//! Durable persistence for the hub: conversations with their gapless turn
//! history, and the append-only learning-episode log.
//!
//! Two backends implement the same traits:
//! - [`SqliteStore`]: the durable backend (WAL, one transaction per turn)
//! - [`MemoryStore`]: process-local, for tests and throwaway hubs

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{ConversationStore, EpisodeLog};
