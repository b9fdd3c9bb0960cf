//! Mock module adapter for deterministic testing.
//!
//! Serves queued replies in order and records every invocation it receives.

use async_trait::async_trait;
use conduit_core::AdapterError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{Invocation, ModuleAdapter};

/// A pre-configured reply from the mock adapter.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub result: Result<Value, AdapterError>,
    /// Simulated processing time before the reply is returned.
    pub delay: Duration,
}

impl MockReply {
    pub fn ok(value: Value) -> Self {
        Self {
            result: Ok(value),
            delay: Duration::ZERO,
        }
    }

    pub fn err(error: AdapterError) -> Self {
        Self {
            result: Err(error),
            delay: Duration::ZERO,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// What the mock does once its queue is empty.
#[derive(Debug, Clone)]
enum Fallback {
    /// Answer with the payload it was given.
    Echo,
    Reply(MockReply),
}

/// A mock module that returns queued replies, then falls back to echoing
/// its input (or to a fixed reply set with [`MockAdapter::always`]).
///
/// # Example
/// ```
/// use conduit_runtime::mock::MockAdapter;
/// use serde_json::json;
/// let adapter = MockAdapter::new("extractor")
///     .with_response(json!({"text": "hello"}));
/// ```
pub struct MockAdapter {
    name: String,
    replies: Mutex<VecDeque<MockReply>>,
    fallback: Mutex<Fallback>,
    latency: Mutex<Duration>,
    healthy: Mutex<bool>,
    /// Every invocation received, in order (for assertions in tests).
    pub invocations: Arc<Mutex<Vec<Invocation>>>,
}

impl MockAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replies: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Fallback::Echo),
            latency: Mutex::new(Duration::ZERO),
            healthy: Mutex::new(true),
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a successful reply.
    pub fn with_response(self, value: Value) -> Self {
        self.replies.lock().push_back(MockReply::ok(value));
        self
    }

    /// Queue a failure.
    pub fn with_error(self, error: AdapterError) -> Self {
        self.replies.lock().push_back(MockReply::err(error));
        self
    }

    pub fn with_reply(self, reply: MockReply) -> Self {
        self.replies.lock().push_back(reply);
        self
    }

    /// Added to every reply's own delay.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Reply used once the queue runs dry.
    pub fn always(self, reply: MockReply) -> Self {
        *self.fallback.lock() = Fallback::Reply(reply);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock() = healthy;
    }

    pub fn calls(&self) -> usize {
        self.invocations.lock().len()
    }

    pub fn last_invocation(&self) -> Option<Invocation> {
        self.invocations.lock().last().cloned()
    }
}

#[async_trait]
impl ModuleAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, invocation: Invocation) -> Result<Value, AdapterError> {
        let echo = invocation.payload.clone();
        self.invocations.lock().push(invocation);

        let queued = self.replies.lock().pop_front();
        let reply = match queued {
            Some(reply) => reply,
            None => match &*self.fallback.lock() {
                Fallback::Echo => MockReply::ok(echo),
                Fallback::Reply(reply) => reply.clone(),
            },
        };

        let wait = reply.delay + *self.latency.lock();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        reply.result
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        if *self.healthy.lock() {
            Ok(())
        } else {
            Err(AdapterError::Unavailable(format!("{} is down", self.name)))
        }
    }
}
