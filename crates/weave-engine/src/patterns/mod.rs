//! The seven pattern executors.
//!
//! Every executor follows the same discipline: compute the successor
//! unit before each checkpoint save, drain in-flight work before a HITL
//! pause, and surface a pause as an explicit [`Outcome::Paused`] value
//! rather than an unwinding error.

pub mod chain;
pub mod dag;
pub mod evaluator;
pub mod graph;
pub mod orchestrator;
pub mod parallel;
pub mod routing;

use serde_json::Value;

use weave_models::error::{EngineError, Result};
use weave_models::session::SessionState;
use weave_models::spec::PatternType;

use crate::context::ExecutionContext;

/// How an executor was entered.
#[derive(Debug, Clone)]
pub enum ResumeMode {
    Fresh,
    Resume { hitl_response: Option<String> },
}

impl ResumeMode {
    pub fn hitl_response(&self) -> Option<&str> {
        match self {
            Self::Fresh => None,
            Self::Resume { hitl_response } => hitl_response.as_deref(),
        }
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, Self::Resume { .. })
    }
}

/// Terminal result of one executor run.
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed { last_response: Option<String> },
    Paused { prompt: String },
}

/// Dispatch to the executor for the session's pattern.
pub async fn run_pattern(
    ctx: &ExecutionContext,
    session: &mut SessionState,
    mode: ResumeMode,
) -> Result<Outcome> {
    match ctx.spec.pattern_type {
        PatternType::Chain => chain::run(ctx, session, mode).await,
        PatternType::Workflow => dag::run(ctx, session, mode).await,
        PatternType::Parallel => parallel::run(ctx, session, mode).await,
        PatternType::Routing => routing::run(ctx, session, mode).await,
        PatternType::EvaluatorOptimizer => evaluator::run(ctx, session, mode).await,
        PatternType::OrchestratorWorkers => orchestrator::run(ctx, session, mode).await,
        PatternType::Graph => graph::run(ctx, session, mode).await,
    }
}

/// Merge `extra`'s top-level keys into `base` (an object).
pub(crate) fn merge_context(base: &mut Value, extra: &Value) {
    if let (Some(map), Some(extra_map)) = (base.as_object_mut(), extra.as_object()) {
        for (key, value) in extra_map {
            map.insert(key.clone(), value.clone());
        }
    }
}

/// A mismatch between session pattern state and spec pattern type means
/// the session directory was tampered with or mixed up.
pub(crate) fn state_mismatch(expected: PatternType) -> EngineError {
    EngineError::Validation(format!(
        "session pattern state does not match pattern_type '{expected}'"
    ))
}

/// Pull the first balanced JSON object out of a model reply.
pub(crate) fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in trimmed[start..].char_indices() {
        match c {
            '\\' if in_string => {
                escaped = !escaped;
                continue;
            }
            '"' if !escaped => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
        escaped = false;
    }
    None
}
