use clap::{Parser, Subcommand};
use std::path::PathBuf;

use conduit_config::{ConduitConfig, ConfigLoader};
use conduit_core::{ConduitError, ConversationId, ConversationStatus, DecisionType};

mod init;
mod inspect;

/// Conduit: adaptive module-communication hub
#[derive(Parser)]
#[command(name = "conduit", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to conduit.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store location, conversation counts and experience-log size
    Status,
    /// List conversations
    Conversations {
        /// Only this status (initiated, active, waiting, closed, timed_out)
        #[arg(short, long)]
        status: Option<ConversationStatus>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one conversation and its turn history
    Show {
        id: ConversationId,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect the experience log of one learner
    Episodes {
        /// module_selection, pipeline_sequencing, resource_allocation or error_recovery
        decision_type: DecisionType,

        /// Draw a uniform sample of this size instead of listing the newest
        #[arg(short, long)]
        sample: Option<usize>,

        /// Sampling seed (defaults to learning.seed)
        #[arg(long, requires = "sample")]
        seed: Option<u64>,

        /// Newest entries to list when not sampling
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Time out conversations idle for longer than conversations.max_idle_secs
    Sweep,
    /// Show version and build info
    Version,
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Initialize a new conduit.toml in the current or home directory
    Init {
        /// Create in current directory instead of ~/.conduit/
        #[arg(long)]
        local: bool,
    },
}

impl Cli {
    pub async fn run(self) -> conduit_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };
        init_tracing(&config, log_level);

        match self.command {
            Commands::Status => inspect::cmd_status(&config, config_loader.path()).await,
            Commands::Conversations { status, json } => inspect::cmd_conversations(&config, status, json).await,
            Commands::Show { id, json } => inspect::cmd_show(&config, id, json).await,
            Commands::Episodes {
                decision_type,
                sample,
                seed,
                limit,
                json,
            } => inspect::cmd_episodes(&config, decision_type, sample, seed, limit, json).await,
            Commands::Sweep => inspect::cmd_sweep(config).await,
            Commands::Version => Self::cmd_version(),
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Init { local } => init::cmd_init(local),
        }
    }

    fn cmd_config(config: &ConduitConfig, json: bool) -> conduit_core::Result<()> {
        let rendered = if json {
            serde_json::to_string_pretty(config)?
        } else {
            toml::to_string_pretty(config).map_err(|e| ConduitError::Config(e.to_string()))?
        };
        println!("{rendered}");
        Ok(())
    }

    fn cmd_version() -> conduit_core::Result<()> {
        println!("Conduit v{}", env!("CARGO_PKG_VERSION"));
        println!("   Rust edition: 2024");
        println!("   Target: {}", std::env::consts::ARCH);
        println!("   OS: {}", std::env::consts::OS);
        #[cfg(debug_assertions)]
        println!("   Profile: debug");
        #[cfg(not(debug_assertions))]
        println!("   Profile: release");
        Ok(())
    }
}

fn init_tracing(config: &ConduitConfig, level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Truncate to `max` characters on one line, appending "..." if cut.
fn truncate_output(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    match flat.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}
