use conduit_config::LearningConfig;
use conduit_core::{DecisionType, Result};
use conduit_store::EpisodeLog;
use std::sync::Arc;
use tracing::info;

use crate::allocation::ResourceAllocator;
use crate::bandit::ModuleSelectionBandit;
use crate::experience::ExperienceCollector;
use crate::recovery::ErrorRecoveryAgent;
use crate::reward::RewardModel;
use crate::sequencing::PipelineSequencer;

/// The four cooperating learners plus the experience collector they learn from.
///
/// Each learner gets its own RNG stream derived from the configured seed, so
/// a fixed seed reproduces every exploration decision.
pub struct DecisionEngine {
    pub bandit: ModuleSelectionBandit,
    pub sequencer: PipelineSequencer,
    pub allocator: ResourceAllocator,
    pub recovery: ErrorRecoveryAgent,
    pub experience: ExperienceCollector,
}

impl DecisionEngine {
    pub fn new(config: &LearningConfig, max_retries: u32, log: Arc<dyn EpisodeLog>) -> Self {
        let seed = config.seed;
        Self {
            bandit: ModuleSelectionBandit::new(config.bandit.clone(), seed),
            sequencer: PipelineSequencer::new(config.sequencing.clone(), seed.wrapping_add(1)),
            allocator: ResourceAllocator::new(config.allocation.clone(), seed.wrapping_add(2)),
            recovery: ErrorRecoveryAgent::new(config.recovery.clone(), max_retries, seed.wrapping_add(3)),
            experience: ExperienceCollector::new(log, RewardModel::new(config.reward.clone()), seed),
        }
    }

    /// Offline/batched training: push one decision type's stored episodes
    /// through the matching learner.
    pub async fn replay(&self, decision_type: DecisionType) -> Result<usize> {
        match decision_type {
            DecisionType::ModuleSelection => self.experience.replay(&self.bandit).await,
            DecisionType::PipelineSequencing => self.experience.replay(&self.sequencer).await,
            DecisionType::ResourceAllocation => self.experience.replay(&self.allocator).await,
            DecisionType::ErrorRecovery => self.experience.replay(&self.recovery).await,
        }
    }

    /// Replay every decision type; used to warm-start a hub from its log.
    pub async fn replay_all(&self) -> Result<usize> {
        let mut total = 0;
        for decision_type in DecisionType::ALL {
            total += self.replay(decision_type).await?;
        }
        if total > 0 {
            info!(episodes = total, "learners warm-started from experience log");
        }
        Ok(total)
    }
}
