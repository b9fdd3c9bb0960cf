use console::style;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use conduit_config::ConduitConfig;
use conduit_core::{ConduitError, ConversationId, ConversationStatus, DecisionType, Episode};
use conduit_learning::{ExperienceCollector, RewardModel};
use conduit_runtime::Hub;
use conduit_store::{ConversationStore, EpisodeLog, SqliteStore};

use super::truncate_output;

/// Open the configured SQLite store read-write. Inspection commands never
/// create a database that doesn't exist yet.
fn open_store(config: &ConduitConfig) -> conduit_core::Result<Arc<SqliteStore>> {
    if config.store.in_memory {
        return Err(ConduitError::Config(
            "store.in_memory is set; there is no persisted state to inspect".into(),
        ));
    }
    let path = &config.store.db_path;
    if !path.exists() {
        return Err(ConduitError::Config(format!(
            "no store at {}; start a hub or run 'conduit init' first",
            path.display()
        )));
    }
    debug!(path = %path.display(), "opening store for inspection");
    Ok(Arc::new(SqliteStore::open(path)?))
}

fn status_style(status: ConversationStatus) -> console::StyledObject<&'static str> {
    let label = status.as_str();
    match status {
        ConversationStatus::Active => style(label).green(),
        ConversationStatus::Waiting => style(label).yellow(),
        ConversationStatus::Initiated => style(label).cyan(),
        ConversationStatus::Closed => style(label).dim(),
        ConversationStatus::TimedOut => style(label).red(),
    }
}

pub(super) async fn cmd_status(config: &ConduitConfig, config_path: &Path) -> conduit_core::Result<()> {
    println!("{}", style("Conduit status").bold());
    println!("   Config: {}", config_path.display());
    println!("   Store:  {}", config.store.db_path.display());

    let store = match open_store(config) {
        Ok(store) => store,
        Err(e) => {
            println!("   {}", style(e.to_string()).yellow());
            return Ok(());
        }
    };

    println!();
    println!("{}", style("Conversations").bold());
    let counts = store.count_by_status().await?;
    if counts.is_empty() {
        println!("   none");
    }
    for (status, count) in counts {
        println!("   {:<10} {count}", status_style(status));
    }

    println!();
    println!("{}", style("Experience log").bold());
    let counts = store.counts().await?;
    if counts.is_empty() {
        println!("   empty");
    }
    for (decision_type, count) in counts {
        println!("   {:<20} {count}", decision_type.as_str());
    }
    Ok(())
}

pub(super) async fn cmd_conversations(
    config: &ConduitConfig,
    status: Option<ConversationStatus>,
    json: bool,
) -> conduit_core::Result<()> {
    let store = open_store(config)?;
    let conversations = store.list_conversations(status).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&conversations)?);
        return Ok(());
    }
    if conversations.is_empty() {
        println!(
            "No conversations{}.",
            status.map(|s| format!(" with status {s}")).unwrap_or_default()
        );
        return Ok(());
    }

    println!("{} ({})", style("Conversations").bold(), conversations.len());
    println!("{}", "-".repeat(100));
    for c in &conversations {
        println!(
            "{}  {:<10} turns={:<4} {}  {}",
            c.id,
            status_style(c.status),
            c.turn_counter,
            style(c.last_activity.format("%Y-%m-%d %H:%M:%S")).dim(),
            truncate_output(&c.participants.join(", "), 40),
        );
    }
    Ok(())
}

pub(super) async fn cmd_show(config: &ConduitConfig, id: ConversationId, json: bool) -> conduit_core::Result<()> {
    let store = open_store(config)?;
    let conversation = store
        .load_conversation(id)
        .await?
        .ok_or(ConduitError::ConversationNotFound(id))?;
    let messages = store.load_messages(id).await?;

    if json {
        let doc = serde_json::json!({
            "conversation": conversation,
            "messages": messages,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("{} {}", style("Conversation").bold(), conversation.id);
    println!("   Status:       {}", status_style(conversation.status));
    println!("   Participants: {}", conversation.participants.join(", "));
    println!("   Turns:        {}", conversation.turn_counter);
    println!("   Created:      {}", conversation.created_at.to_rfc3339());
    println!("   Last active:  {}", conversation.last_activity.to_rfc3339());
    if !conversation.context.is_empty() {
        println!("   Context:");
        for (key, value) in &conversation.context {
            println!("     {key} = {}", truncate_output(&value.to_string(), 80));
        }
    }

    println!();
    for m in &messages {
        let reply = if m.in_reply_to.is_some() { " (reply)" } else { "" };
        println!(
            "{:>4}  {} -> {}{}",
            style(m.turn).bold(),
            style(&m.source).cyan(),
            style(&m.target).cyan(),
            style(reply).dim(),
        );
        println!("      {}", style(truncate_output(&m.payload.to_string(), 120)).dim());
    }
    Ok(())
}

pub(super) async fn cmd_episodes(
    config: &ConduitConfig,
    decision_type: DecisionType,
    sample: Option<usize>,
    seed: Option<u64>,
    limit: usize,
    json: bool,
) -> conduit_core::Result<()> {
    let store = open_store(config)?;

    let episodes: Vec<Episode> = match sample {
        Some(size) => {
            let seed = seed.unwrap_or(config.learning.seed);
            let collector = ExperienceCollector::new(
                store as Arc<dyn EpisodeLog>,
                RewardModel::new(config.learning.reward.clone()),
                seed,
            );
            collector.sample_with_seed(decision_type, size, seed).await?
        }
        None => {
            let all = store.load(decision_type).await?;
            let skip = all.len().saturating_sub(limit);
            all.into_iter().skip(skip).collect()
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&episodes)?);
        return Ok(());
    }
    if episodes.is_empty() {
        println!("No {decision_type} episodes recorded.");
        return Ok(());
    }

    println!("{} {} ({})", style("Episodes").bold(), decision_type, episodes.len());
    println!("{}", "-".repeat(100));
    for e in &episodes {
        let reward = if e.reward >= 0.0 {
            style(format!("{:+.3}", e.reward)).green()
        } else {
            style(format!("{:+.3}", e.reward)).red()
        };
        println!(
            "{}  {reward}  {}",
            style(e.recorded_at.format("%Y-%m-%d %H:%M:%S")).dim(),
            truncate_output(&e.action.to_string(), 40),
        );
        println!("      {}", style(truncate_output(&e.state.to_string(), 120)).dim());
    }
    Ok(())
}

/// Open a hub on the store just long enough to run one sweep.
pub(super) async fn cmd_sweep(config: ConduitConfig) -> conduit_core::Result<()> {
    open_store(&config)?;
    let max_idle = config.conversations.max_idle_secs;
    let hub = Hub::open(config).await?;
    let result = hub.sweep().await;
    hub.shutdown().await;

    let timed_out = result?;
    if timed_out.is_empty() {
        println!("No conversation idle for more than {max_idle}s.");
    } else {
        println!("Timed out {} conversation(s):", timed_out.len());
        for id in timed_out {
            println!("   {id}");
        }
    }
    Ok(())
}
