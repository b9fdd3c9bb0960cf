//! Multi-step pipelines.
//!
//! A pipeline is an ordered list of steps. A step whose `input` mentions
//! `$previous.output` (or `$previous.output.<path>`) consumes the output of
//! the step declared right before it and can't run until that step has;
//! every other step is independent. The pipeline-sequencing agent picks the
//! next step among the ready ones and may stop early once only optional
//! steps remain.

use conduit_core::{ConduitError, ConversationId, DecisionType, Result};
use conduit_learning::{Learner, Outcome, PendingStep, PipelineState, SequenceAction, Urgency};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use crate::router::{MessageRouter, RouteError, RouteRequest};

const PREVIOUS_OUTPUT: &str = "$previous.output";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<PipelineStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub name: String,
    /// Module to run. When absent the bandit picks a `capability` provider.
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    /// Payload template; see the module docs for `$previous.output`.
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub optional: bool,
}

impl PipelineStep {
    pub fn uses_previous(&self) -> bool {
        references_previous(&self.input)
    }
}

impl PipelineSpec {
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| ConduitError::Config(format!("pipeline '{}': {reason}", self.name));
        if self.name.trim().is_empty() {
            return Err(ConduitError::Config("pipeline name is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(invalid("no steps".into()));
        }
        let mut names = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if !names.insert(step.name.as_str()) {
                return Err(invalid(format!("duplicate step '{}'", step.name)));
            }
            if step.module.is_none() && step.capability.is_none() {
                return Err(invalid(format!("step '{}' names neither a module nor a capability", step.name)));
            }
            if i == 0 && step.uses_previous() {
                return Err(invalid(format!("first step '{}' has no previous output", step.name)));
            }
        }
        Ok(())
    }
}

/// What a pipeline run did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub pipeline: String,
    pub conversation_id: Option<ConversationId>,
    /// Steps that ran, in execution order.
    pub executed: Vec<String>,
    /// Steps the recovery agent chose to skip after a failure.
    pub skipped: Vec<String>,
    /// Optional steps left out when the sequencer terminated early.
    pub not_run: Vec<String>,
    pub outputs: BTreeMap<String, Value>,
    pub total_reward: f64,
}

impl MessageRouter {
    /// Run `spec` with `origin` as the module that feeds independent steps.
    /// Each step is routed as its own message in one shared conversation.
    pub async fn run_pipeline(&self, spec: &PipelineSpec, origin: &str) -> std::result::Result<PipelineReport, RouteError> {
        spec.validate().map_err(|e| RouteError::bare(e, None))?;
        let engine = self.engine();

        let mut remaining: Vec<usize> = (0..spec.steps.len()).collect();
        let mut outputs: BTreeMap<usize, Value> = BTreeMap::new();
        let mut served: BTreeMap<usize, String> = BTreeMap::new();
        let mut last: Option<usize> = None;
        let mut conversation: Option<ConversationId> = None;
        let mut report = PipelineReport {
            pipeline: spec.name.clone(),
            conversation_id: None,
            executed: Vec::new(),
            skipped: Vec::new(),
            not_run: Vec::new(),
            outputs: BTreeMap::new(),
            total_reward: 0.0,
        };

        while !remaining.is_empty() {
            let state = pipeline_state(spec, &remaining, last);
            let action = engine
                .sequencer
                .select_action(&state)
                .map_err(|e| RouteError::bare(e, conversation))?
                .action;

            let name = match &action {
                SequenceAction::Terminate => {
                    self.learn_sequence(&state, &action, 0.0, None).await;
                    break;
                }
                SequenceAction::Run(name) => name.clone(),
            };
            let Some(idx) = remaining.iter().copied().find(|&i| spec.steps[i].name == name) else {
                return Err(RouteError::bare(
                    ConduitError::Config(format!("sequencer chose unknown step '{name}'")),
                    conversation,
                ));
            };
            let step = &spec.steps[idx];

            // A verbatim forward keeps the predecessor's output schema; a
            // template reshapes the payload, so the origin is its author.
            let (source, payload) = if step.uses_previous() {
                let previous = outputs.get(&(idx - 1)).cloned().unwrap_or(Value::Null);
                let source = match served.get(&(idx - 1)) {
                    Some(module) if step.input == Value::String(PREVIOUS_OUTPUT.into()) => module.clone(),
                    _ => origin.to_string(),
                };
                (source, resolve(&step.input, &previous))
            } else if step.input.is_null() {
                (origin.to_string(), Value::Object(Map::new()))
            } else {
                (origin.to_string(), step.input.clone())
            };

            let request = RouteRequest {
                source,
                target: step.module.clone(),
                capability: step.capability.clone(),
                task_type: Some(format!("{}.{}", spec.name, step.name)),
                urgency: Urgency::default(),
                priority: None,
                payload,
                conversation_id: conversation,
                action: step.action.clone(),
                skippable: step.optional,
            };

            debug!(pipeline = %spec.name, step = %step.name, "running pipeline step");
            let outcome = match self.route(request).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let reward = engine.experience.reward_model().reward(&Outcome::failure(0));
                    self.learn_sequence(&state, &action, reward, None).await;
                    warn!(pipeline = %spec.name, step = %step.name, error = %e, "pipeline step failed");
                    return Err(e);
                }
            };
            conversation = Some(outcome.conversation_id);

            self.conversations()
                .update_context(outcome.conversation_id, &step.name, outcome.output.clone())
                .await
                .map_err(|e| RouteError::bare(e, conversation))?;

            remaining.retain(|&i| i != idx);
            last = Some(idx);
            if outcome.skipped {
                report.skipped.push(step.name.clone());
            } else {
                report.executed.push(step.name.clone());
                served.insert(idx, outcome.module.clone());
            }
            report.total_reward += outcome.reward;
            outputs.insert(idx, outcome.output);

            let next = (!remaining.is_empty()).then(|| pipeline_state(spec, &remaining, last));
            self.learn_sequence(&state, &action, outcome.reward, next.as_ref()).await;
        }

        report.not_run = remaining.iter().map(|&i| spec.steps[i].name.clone()).collect();
        report.conversation_id = conversation;
        report.outputs = outputs
            .into_iter()
            .map(|(i, v)| (spec.steps[i].name.clone(), v))
            .collect();
        info!(
            pipeline = %spec.name,
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            not_run = report.not_run.len(),
            "pipeline finished"
        );
        Ok(report)
    }

    async fn learn_sequence(
        &self,
        state: &PipelineState,
        action: &SequenceAction,
        reward: f64,
        next: Option<&PipelineState>,
    ) {
        let engine = self.engine();
        engine.sequencer.observe(state, action, reward, next);
        if let Err(e) = engine
            .experience
            .record_reward(DecisionType::PipelineSequencing, state, action, reward, next)
            .await
        {
            warn!(error = %e, "failed to record sequencing episode");
        }
    }
}

fn pipeline_state(spec: &PipelineSpec, remaining: &[usize], last: Option<usize>) -> PipelineState {
    PipelineState {
        pipeline: spec.name.clone(),
        last_completed: last.map(|i| spec.steps[i].name.clone()),
        remaining: remaining
            .iter()
            .map(|&i| {
                let step = &spec.steps[i];
                PendingStep {
                    name: step.name.clone(),
                    optional: step.optional,
                    ready: i == 0 || !step.uses_previous() || !remaining.contains(&(i - 1)),
                }
            })
            .collect(),
    }
}

fn references_previous(value: &Value) -> bool {
    match value {
        Value::String(s) => s == PREVIOUS_OUTPUT || s.starts_with("$previous.output."),
        Value::Array(items) => items.iter().any(references_previous),
        Value::Object(map) => map.values().any(references_previous),
        _ => false,
    }
}

/// Substitute every `$previous.output[.path]` string in `template`.
/// Unresolvable paths become `null`.
pub fn resolve(template: &Value, previous: &Value) -> Value {
    match template {
        Value::String(s) if s == PREVIOUS_OUTPUT => previous.clone(),
        Value::String(s) => match s.strip_prefix("$previous.output.") {
            Some(path) => lookup(previous, path).cloned().unwrap_or(Value::Null),
            None => template.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, previous)).collect()),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), resolve(v, previous))).collect()),
        other => other.clone(),
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
