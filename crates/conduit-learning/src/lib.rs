//! # conduit-learning
//!
//! The adaptive half of the hub: tiered reward shaping, the experience
//! collector, and the four learners consulted at decision points.
//!
//! - [`ModuleSelectionBandit`]: which module serves a capability
//! - [`PipelineSequencer`]: which pipeline step runs next, or stop
//! - [`ResourceAllocator`]: CPU/memory/deadline/priority per dispatch
//! - [`ErrorRecoveryAgent`]: what to do about a transient failure

pub mod allocation;
pub mod bandit;
pub mod engine;
pub mod experience;
pub mod learner;
pub mod recovery;
pub mod reward;
pub mod sequencing;

pub use allocation::{AllocationState, ResourceAllocator};
pub use bandit::{ArmStats, Candidate, ModuleSelectionBandit, SizeClass, TaskFeatures, Urgency};
pub use engine::DecisionEngine;
pub use experience::ExperienceCollector;
pub use learner::{Committed, Decision, Learner};
pub use recovery::{ErrorRecoveryAgent, FailureKind, FailureSignature, RecoveryAction};
pub use reward::{Outcome, RewardBreakdown, RewardModel};
pub use sequencing::{PendingStep, PipelineSequencer, PipelineState, SequenceAction};
