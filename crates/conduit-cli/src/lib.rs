//! # conduit-cli
//!
//! Command-line interface for the Conduit hub.
//!
//! ## Commands
//!
//! - `conduit status`: store location, conversations by status, episode counts
//! - `conduit conversations`: list conversations, optionally by status
//! - `conduit show <id>`: one conversation with its full turn history
//! - `conduit episodes <decision-type>`: inspect or sample the experience log
//! - `conduit sweep`: run one inactivity sweep against the store
//! - `conduit config`: print the effective configuration
//! - `conduit init`: write a starter `conduit.toml`

pub mod commands;

pub use commands::Cli;
