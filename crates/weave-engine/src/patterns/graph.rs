//! Graph executor: a state machine with conditional edges, per-node
//! iteration caps, and first-class HITL nodes.
//!
//! The entry node is the first key of the insertion-ordered node map.
//! Successors are always computed before a checkpoint is saved, so a
//! crashed or paused run resumes at the next unit. A HITL node with no
//! outgoing edge completes the workflow when its response is injected.

use chrono::Utc;
use serde_json::{json, Value};

use weave_models::error::{EngineError, Result};
use weave_models::session::{
    GraphState, HitlState, NodeResult, NodeStatus, PatternState, SessionState,
};
use weave_models::spec::{GraphConfig, PatternConfig, PatternType};
use weave_models::EventKind;

use crate::context::ExecutionContext;
use crate::patterns::{state_mismatch, Outcome, ResumeMode};
use crate::template;

const DEFAULT_STEP_BOUND: u64 = 100;

fn store_state(session: &mut SessionState, state: &GraphState) -> Result<()> {
    match &mut session.pattern_state {
        PatternState::Graph(slot) => {
            *slot = state.clone();
            Ok(())
        }
        _ => Err(state_mismatch(PatternType::Graph)),
    }
}

/// Edge-evaluation context: node results plus loop bookkeeping.
fn graph_context(ctx: &ExecutionContext, session: &SessionState, state: &GraphState) -> Value {
    let mut context = ctx.base_context(session);
    if let Some(map) = context.as_object_mut() {
        map.insert(
            "nodes".to_string(),
            serde_json::to_value(&state.node_results).unwrap_or_default(),
        );
        map.insert(
            "last_response".to_string(),
            state
                .execution_path
                .last()
                .and_then(|id| state.node_results.get(id))
                .map(|result| Value::String(result.response.clone()))
                .unwrap_or(Value::Null),
        );
        map.insert("total_steps".to_string(), json!(state.total_steps));
        map.insert(
            "iteration_counts".to_string(),
            serde_json::to_value(&state.iteration_counts).unwrap_or_default(),
        );
        let hitl_response = state
            .hitl_state
            .as_ref()
            .and_then(|h| h.user_response.clone())
            .map(Value::String)
            .unwrap_or(Value::Null);
        map.insert("hitl_response".to_string(), hitl_response);
    }
    context
}

/// Evaluate outgoing edges for a node. `choose` clauses pick the first
/// truthy `when` (the literal `else` always matches); a `to` list is
/// single-successor with extra entries reserved. No match means the
/// node is terminal.
fn next_node_for(config: &GraphConfig, node_id: &str, context: &Value) -> Result<Option<String>> {
    for edge in config.edges.iter().filter(|edge| edge.from == node_id) {
        if let Some(clauses) = &edge.choose {
            for clause in clauses {
                if template::eval_condition(&clause.when, context)? {
                    return Ok(Some(clause.to.clone()));
                }
            }
        }
        if let Some(targets) = &edge.to {
            if let Some(first) = targets.first() {
                return Ok(Some(first.clone()));
            }
        }
    }
    Ok(None)
}

/// Guard the per-node iteration cap before entering `next`.
fn check_iteration_limit(config: &GraphConfig, state: &GraphState, next: &str) -> Result<()> {
    let count = state.iteration_counts.get(next).copied().unwrap_or(0);
    if count >= config.max_iterations {
        return Err(EngineError::IterationLimit(format!(
            "node '{next}' reached {count} iterations (max_iterations {})",
            config.max_iterations
        )));
    }
    Ok(())
}

/// Record an answered HITL node: the response becomes the node result
/// and counts as one iteration of the node.
fn inject_node_response(state: &mut GraphState, response: &str) -> Option<String> {
    let hitl = state.hitl_state.as_mut()?;
    if !hitl.active {
        return None;
    }
    let node_id = hitl.node_id.clone()?;
    hitl.active = false;
    hitl.user_response = Some(response.to_string());

    let count = state.iteration_counts.entry(node_id.clone()).or_insert(0);
    *count += 1;
    let iteration = *count;
    state.node_results.insert(
        node_id.clone(),
        NodeResult {
            response: response.to_string(),
            node_type: "hitl".to_string(),
            status: NodeStatus::Success,
            iteration,
        },
    );
    state.execution_path.push(node_id.clone());
    state.total_steps += 1;
    Some(node_id)
}

/// Edge evaluation after a HITL answer, with the response visible to
/// `when` conditions. Returns the terminal response if the graph ends
/// here.
fn advance_past_hitl(
    ctx: &ExecutionContext,
    session: &mut SessionState,
    config: &GraphConfig,
    state: &mut GraphState,
    node_id: &str,
    response: &str,
) -> Result<Option<String>> {
    let context = graph_context(ctx, session, state);
    let next = next_node_for(config, node_id, &context)?;
    match next {
        Some(next) => {
            check_iteration_limit(config, state, &next)?;
            state.current_node = Some(next);
            store_state(session, state)?;
            ctx.save_session(session)?;
            Ok(None)
        }
        None => {
            // Terminal HITL node: the response completes the workflow.
            state.current_node = None;
            store_state(session, state)?;
            ctx.save_session(session)?;
            Ok(Some(response.to_string()))
        }
    }
}

pub async fn run(
    ctx: &ExecutionContext,
    session: &mut SessionState,
    mode: ResumeMode,
) -> Result<Outcome> {
    let PatternConfig::Graph(config) = &ctx.spec.config else {
        return Err(state_mismatch(PatternType::Graph));
    };
    let PatternState::Graph(existing) = &session.pattern_state else {
        return Err(state_mismatch(PatternType::Graph));
    };
    let mut state = existing.clone();

    // Entry node = first key of the insertion-ordered mapping. A state
    // with no progress at all (fresh run, or a crash before the first
    // checkpoint) starts from the entry.
    if state.current_node.is_none()
        && state.execution_path.is_empty()
        && state.hitl_state.is_none()
    {
        let entry = config
            .nodes
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| EngineError::Validation("graph has no nodes".to_string()))?;
        state.iteration_counts.entry(entry.clone()).or_insert(0);
        state.current_node = Some(entry);
    }

    // Resume injection: answer the pending HITL node, then evaluate its
    // edges with the response available.
    if let Some(hitl) = state.hitl_state.clone().filter(|h| h.active) {
        let Some(response) = mode.hitl_response() else {
            return Err(EngineError::WaitingForHitl(format!(
                "session {} is paused at node '{}'",
                session.session_id(),
                hitl.node_id.as_deref().unwrap_or("?")
            )));
        };
        if let Some(node_id) = inject_node_response(&mut state, response) {
            ctx.emit(
                session,
                EventKind::NodeComplete,
                json!({"node_id": node_id, "type": "hitl"}),
            );
            if let Some(terminal) =
                advance_past_hitl(ctx, session, config, &mut state, &node_id, response)?
            {
                return Ok(Outcome::Completed {
                    last_response: Some(terminal),
                });
            }
        }
    }

    let step_bound = ctx
        .budgets()
        .max_steps
        .unwrap_or(DEFAULT_STEP_BOUND);

    while let Some(node_id) = state.current_node.clone() {
        ctx.check_cancelled()?;
        if state.total_steps >= step_bound {
            return Err(EngineError::BudgetExceeded(format!(
                "graph executed {} steps, max_steps {step_bound}",
                state.total_steps
            )));
        }

        let node = config.nodes.get(&node_id).ok_or_else(|| {
            EngineError::Validation(format!("current node '{node_id}' is not in the graph"))
        })?;
        let context = graph_context(ctx, session, &state);

        if node.is_hitl() {
            let prompt =
                template::render(node.prompt.as_deref().unwrap_or("Continue?"), &context)?;
            let context_display = node
                .context_display
                .as_deref()
                .map(|display| template::render_permissive(display, &context))
                .transpose()?;
            let mut hitl = HitlState::new(prompt)
                .with_context_display(context_display)
                .with_default_response(node.default.clone())
                .with_timeout(node.timeout, Utc::now());
            hitl.node_id = Some(node_id.clone());

            let iteration = state.iteration_counts.get(&node_id).copied().unwrap_or(0) + 1;
            state.node_results.insert(
                node_id.clone(),
                NodeResult {
                    response: String::new(),
                    node_type: "hitl".to_string(),
                    status: NodeStatus::WaitingForUser,
                    iteration,
                },
            );
            state.hitl_state = Some(hitl.clone());
            // The next unit is the response injection at this node;
            // current_node stays put for the checkpoint.
            store_state(session, &state)?;
            session.token_usage = ctx.meter.snapshot();

            match ctx.pause_for_hitl(session, &hitl)? {
                Some(response) => {
                    if let Some(answered) = inject_node_response(&mut state, &response) {
                        ctx.emit(
                            session,
                            EventKind::NodeComplete,
                            json!({"node_id": answered, "type": "hitl"}),
                        );
                        if let Some(terminal) = advance_past_hitl(
                            ctx, session, config, &mut state, &answered, &response,
                        )? {
                            return Ok(Outcome::Completed {
                                last_response: Some(terminal),
                            });
                        }
                    }
                    continue;
                }
                None => return Ok(Outcome::Paused { prompt: hitl.prompt }),
            }
        }

        // Agent node.
        let agent_id = node.agent.clone().ok_or_else(|| {
            EngineError::Validation(format!("node '{node_id}' has no agent"))
        })?;
        ctx.emit(
            session,
            EventKind::NodeStart,
            json!({"node_id": node_id, "agent": agent_id}),
        );
        let prompt = template::render(node.template(), &context)?;
        let record = ctx
            .invoke(session, &agent_id, node.tools.as_deref(), None, &prompt)
            .await?;

        let count = state.iteration_counts.entry(node_id.clone()).or_insert(0);
        *count += 1;
        let iteration = *count;
        state.node_results.insert(
            node_id.clone(),
            NodeResult {
                response: record.text.clone(),
                node_type: "agent".to_string(),
                status: NodeStatus::Success,
                iteration,
            },
        );
        state.execution_path.push(node_id.clone());
        state.total_steps += 1;
        ctx.emit(
            session,
            EventKind::NodeComplete,
            json!({"node_id": node_id, "tokens": record.tokens(), "iteration": iteration}),
        );

        // Evaluate edges with the fresh result, then checkpoint with the
        // successor already in place.
        let context = graph_context(ctx, session, &state);
        match next_node_for(config, &node_id, &context)? {
            Some(next) => {
                check_iteration_limit(config, &state, &next)?;
                state.current_node = Some(next);
            }
            None => {
                state.current_node = None;
            }
        }
        store_state(session, &state)?;
        session.token_usage = ctx.meter.snapshot();
        ctx.save_session(session)?;
    }

    let last_response = state
        .execution_path
        .last()
        .and_then(|id| state.node_results.get(id))
        .map(|result| result.response.clone());
    Ok(Outcome::Completed { last_response })
}
