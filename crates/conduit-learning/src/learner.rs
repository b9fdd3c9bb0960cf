use arc_swap::ArcSwap;
use conduit_core::{DecisionType, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// A chosen action together with how sure the learner is about it, in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision<A> {
    pub action: A,
    pub confidence: f64,
}

impl<A> Decision<A> {
    pub fn new(action: A, confidence: f64) -> Self {
        Self {
            action,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Contract shared by the four decision learners.
///
/// `select_action` may run concurrently with an in-flight `observe`; it always
/// reads the last committed parameters. Updates for one learner are serialized.
pub trait Learner: Send + Sync {
    type State: Serialize + DeserializeOwned + Send + Sync;
    type Action: Serialize + DeserializeOwned + Send + Sync;

    /// The episode stream this learner consumes.
    const DECISION_TYPE: DecisionType;

    fn select_action(&self, state: &Self::State) -> Result<Decision<Self::Action>>;

    fn observe(&self, state: &Self::State, action: &Self::Action, reward: f64, next_state: Option<&Self::State>);
}

/// Committed-snapshot cell for learner parameters.
///
/// Readers get the last committed `Arc` without blocking. Writers take the
/// update lock, edit a private copy and publish it in one store.
pub struct Committed<P> {
    current: ArcSwap<P>,
    update: Mutex<()>,
}

impl<P: Clone> Committed<P> {
    pub fn new(params: P) -> Self {
        Self {
            current: ArcSwap::from_pointee(params),
            update: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<P> {
        self.current.load_full()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        let _guard = self.update.lock();
        let mut next = P::clone(&self.current.load());
        let out = f(&mut next);
        self.current.store(Arc::new(next));
        out
    }
}

impl<P: Clone + Default> Default for Committed<P> {
    fn default() -> Self {
        Self::new(P::default())
    }
}
