use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::conversation::ConversationManager;

/// Run `cleanup_inactive` every `interval` until `cancel` fires.
///
/// The first sweep happens one full interval after spawning.
pub fn spawn_sweeper(
    manager: Arc<ConversationManager>,
    interval: Duration,
    max_idle: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval() fires immediately; swallow that tick
        ticker.tick().await;
        info!(interval_ms = interval.as_millis() as u64, max_idle_secs = max_idle.as_secs(), "sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match manager.cleanup_inactive(max_idle).await {
                        Ok(timed_out) if !timed_out.is_empty() => {
                            info!(count = timed_out.len(), "sweeper timed out idle conversations");
                        }
                        Ok(_) => debug!("sweep found nothing idle"),
                        Err(e) => error!(error = %e, "sweep failed"),
                    }
                }
            }
        }
        info!("sweeper stopped");
    })
}
