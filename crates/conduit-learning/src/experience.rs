use conduit_core::{DecisionType, Episode, Result};
use conduit_store::EpisodeLog;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::learner::Learner;
use crate::reward::{Outcome, RewardModel};

/// Records (state, action, reward, next-state) episodes to the append-only
/// log and serves them back for offline training.
///
/// Sampling is reservoir sampling (Algorithm R) over one decision type's
/// episodes in append order, driven by a `StdRng` seeded from the configured
/// seed: the same log and seed always produce the same batch.
#[derive(Clone)]
pub struct ExperienceCollector {
    log: Arc<dyn EpisodeLog>,
    reward: RewardModel,
    seed: u64,
}

impl ExperienceCollector {
    pub fn new(log: Arc<dyn EpisodeLog>, reward: RewardModel, seed: u64) -> Self {
        Self { log, reward, seed }
    }

    pub fn reward_model(&self) -> &RewardModel {
        &self.reward
    }

    pub async fn record(&self, episode: Episode) -> Result<()> {
        debug!(decision_type = %episode.decision_type, reward = episode.reward, "recording episode");
        self.log.append(&episode).await
    }

    /// Score `outcome` with the reward model and record the episode. Returns
    /// the reward so the caller can feed the learner online.
    pub async fn record_outcome<S, A>(
        &self,
        decision_type: DecisionType,
        state: &S,
        action: &A,
        outcome: &Outcome,
        next_state: Option<&S>,
    ) -> Result<f64>
    where
        S: Serialize + Sync,
        A: Serialize + Sync,
    {
        let reward = self.reward.reward(outcome);
        self.record_reward(decision_type, state, action, reward, next_state).await?;
        Ok(reward)
    }

    /// Record an episode whose reward was computed elsewhere.
    pub async fn record_reward<S, A>(
        &self,
        decision_type: DecisionType,
        state: &S,
        action: &A,
        reward: f64,
        next_state: Option<&S>,
    ) -> Result<()>
    where
        S: Serialize + Sync,
        A: Serialize + Sync,
    {
        let mut episode = Episode::new(
            decision_type,
            serde_json::to_value(state)?,
            serde_json::to_value(action)?,
            reward,
        );
        if let Some(next) = next_state {
            episode = episode.with_next_state(serde_json::to_value(next)?);
        }
        self.record(episode).await
    }

    pub async fn sample(&self, decision_type: DecisionType, batch_size: usize) -> Result<Vec<Episode>> {
        self.sample_with_seed(decision_type, batch_size, self.seed).await
    }

    pub async fn sample_with_seed(
        &self,
        decision_type: DecisionType,
        batch_size: usize,
        seed: u64,
    ) -> Result<Vec<Episode>> {
        let episodes = self.log.load(decision_type).await?;
        Ok(reservoir(episodes, batch_size, seed))
    }

    /// Feed every stored episode of the learner's decision type through its
    /// `observe`, in append order. Episodes that no longer decode into the
    /// learner's types are skipped. Returns how many were replayed.
    pub async fn replay<L: Learner>(&self, learner: &L) -> Result<usize> {
        let episodes = self.log.load(L::DECISION_TYPE).await?;
        let mut replayed = 0;
        for episode in episodes {
            let decoded = serde_json::from_value::<L::State>(episode.state)
                .and_then(|s| serde_json::from_value::<L::Action>(episode.action).map(|a| (s, a)));
            let (state, action) = match decoded {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(id = %episode.id, error = %e, "skipping undecodable episode");
                    continue;
                }
            };
            let next = episode
                .next_state
                .and_then(|n| serde_json::from_value::<L::State>(n).ok());
            learner.observe(&state, &action, episode.reward, next.as_ref());
            replayed += 1;
        }
        debug!(decision_type = %L::DECISION_TYPE, replayed, "replayed episodes");
        Ok(replayed)
    }
}

/// Algorithm R: keep the first `k` items, then replace a random slot with
/// item `i` with probability `k / (i + 1)`. Output keeps append order.
fn reservoir<T>(items: Vec<T>, k: usize, seed: u64) -> Vec<T> {
    if k == 0 {
        return Vec::new();
    }
    if items.len() <= k {
        return items;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut slots: Vec<usize> = (0..k).collect();
    for i in k..items.len() {
        let j = rng.random_range(0..=i);
        if j < k {
            slots[j] = i;
        }
    }
    slots.sort_unstable();
    let mut keep = slots.into_iter().peekable();
    items
        .into_iter()
        .enumerate()
        .filter_map(|(i, item)| {
            if keep.peek() == Some(&i) {
                keep.next();
                Some(item)
            } else {
                None
            }
        })
        .collect()
}
