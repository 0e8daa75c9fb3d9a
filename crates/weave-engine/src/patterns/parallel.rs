//! Parallel executor: concurrent fan-out branches (each a mini-chain)
//! with an optional reduce step.
//!
//! A HITL gate inside a branch lets sibling branches drain before the
//! single pause checkpoint is written; branch failures are recorded and
//! reduce proceeds with them marked, unless there is no reduce at all.

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};

use weave_models::error::{EngineError, Result};
use weave_models::session::{
    ChainState, HitlState, HitlStepType, ParallelState, PatternState, SessionState, StepRecord,
    TaskOutput,
};
use weave_models::spec::{BranchDef, PatternConfig, PatternType};
use weave_models::EventKind;

use crate::context::ExecutionContext;
use crate::patterns::chain::inject_chain_response;
use crate::patterns::{state_mismatch, Outcome, ResumeMode};
use crate::template;

fn store_state(session: &mut SessionState, state: &ParallelState) -> Result<()> {
    match &mut session.pattern_state {
        PatternState::Parallel(slot) => {
            *slot = state.clone();
            Ok(())
        }
        _ => Err(state_mismatch(PatternType::Parallel)),
    }
}

/// Result of driving one branch as far as it can go.
enum BranchRun {
    Done(ChainState),
    Paused(ChainState, HitlState),
    Failed(ChainState, EngineError),
}

/// Execute one branch's steps sequentially from its saved state. No
/// checkpoints are written here; the coordinator persists after the
/// whole fan-out settles.
async fn run_branch(
    ctx: &ExecutionContext,
    session: &SessionState,
    branch: &BranchDef,
    mut chain: ChainState,
) -> BranchRun {
    let mut index = chain.current_step;
    while index < branch.steps.len() {
        let step = &branch.steps[index];

        let mut context = ctx.base_context(session);
        if let Some(map) = context.as_object_mut() {
            map.insert(
                "steps".to_string(),
                serde_json::to_value(&chain.step_history).unwrap_or_default(),
            );
            map.insert(
                "last_response".to_string(),
                chain
                    .step_history
                    .last()
                    .map(|record| Value::String(record.response.clone()))
                    .unwrap_or(Value::Null),
            );
            map.insert("branch_id".to_string(), Value::String(branch.id.clone()));
            let hitl_response = chain
                .step_history
                .iter()
                .rev()
                .find(|record| record.agent == "hitl")
                .map(|record| Value::String(record.response.clone()))
                .unwrap_or(Value::Null);
            map.insert("hitl_response".to_string(), hitl_response);
        }

        if step.is_hitl() {
            let prompt = match template::render(
                step.prompt.as_deref().unwrap_or("Continue?"),
                &context,
            ) {
                Ok(prompt) => prompt,
                Err(error) => return BranchRun::Failed(chain, error),
            };
            let context_display = match step
                .context_display
                .as_deref()
                .map(|display| template::render_permissive(display, &context))
                .transpose()
            {
                Ok(display) => display,
                Err(error) => return BranchRun::Failed(chain, error),
            };
            let mut hitl = HitlState::new(prompt)
                .with_context_display(context_display)
                .with_default_response(step.default.clone())
                .with_timeout(step.timeout, Utc::now());
            hitl.branch_id = Some(branch.id.clone());
            hitl.step_type = Some(HitlStepType::Branch);
            hitl.step_index = Some(index);
            chain.current_step = index;
            chain.hitl_state = Some(hitl.clone());
            return BranchRun::Paused(chain, hitl);
        }

        let Some(agent_id) = step.agent.clone() else {
            return BranchRun::Failed(
                chain,
                EngineError::Validation(format!(
                    "branch '{}' step {index} has no agent",
                    branch.id
                )),
            );
        };

        let prompt = match template::render(step.template(), &context) {
            Ok(prompt) => prompt,
            Err(error) => return BranchRun::Failed(chain, error),
        };
        match ctx
            .invoke(session, &agent_id, step.tools.as_deref(), None, &prompt)
            .await
        {
            Ok(record) => {
                let tokens_estimated = record.tokens();
                chain.step_history.push(StepRecord {
                    index,
                    agent: agent_id,
                    response: record.text,
                    tokens_estimated,
                });
                chain.current_step = index + 1;
                index += 1;
            }
            Err(error) => return BranchRun::Failed(chain, error),
        }
    }
    BranchRun::Done(chain)
}

fn branch_tokens(chain: &ChainState) -> u64 {
    chain
        .step_history
        .iter()
        .map(|record| record.tokens_estimated)
        .sum()
}

fn branches_context(state: &ParallelState) -> Value {
    json!({"branches": state.branch_outputs})
}

fn synthesized_response(state: &ParallelState) -> String {
    state
        .branch_outputs
        .iter()
        .map(|(id, output)| match &output.error {
            None => format!("{id}: {}", output.response),
            Some(error) => format!("{id}: <failed: {error}>"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn run(
    ctx: &ExecutionContext,
    session: &mut SessionState,
    mode: ResumeMode,
) -> Result<Outcome> {
    let PatternConfig::Parallel(config) = &ctx.spec.config else {
        return Err(state_mismatch(PatternType::Parallel));
    };
    let PatternState::Parallel(existing) = &session.pattern_state else {
        return Err(state_mismatch(PatternType::Parallel));
    };
    let mut state = existing.clone();

    // Resume injection for a pause inside a branch or before reduce.
    if let Some(hitl) = state.hitl_state.clone().filter(|h| h.active) {
        let Some(response) = mode.hitl_response() else {
            return Err(EngineError::WaitingForHitl(format!(
                "session {} is paused for a parallel {} gate",
                session.session_id(),
                match hitl.step_type {
                    Some(HitlStepType::Reduce) => "reduce",
                    _ => "branch",
                }
            )));
        };
        match hitl.step_type {
            Some(HitlStepType::Branch) => {
                let branch_id = hitl.branch_id.clone().unwrap_or_default();
                if let Some(chain) = state.branch_states.get_mut(&branch_id) {
                    inject_chain_response(chain, response);
                }
                if let Some(h) = state.hitl_state.as_mut() {
                    h.active = false;
                    h.user_response = Some(response.to_string());
                }
            }
            _ => {
                if let Some(h) = state.hitl_state.as_mut() {
                    h.active = false;
                    h.user_response = Some(response.to_string());
                }
            }
        }
        store_state(session, &state)?;
        ctx.save_session(session)?;
    }

    // Branch fan-out, repeated until every branch either completed or
    // the run pauses.
    loop {
        ctx.check_cancelled()?;

        let pending: Vec<&BranchDef> = config
            .branches
            .iter()
            .filter(|branch| !state.completed_branches.contains(&branch.id))
            .collect();
        if pending.is_empty() {
            break;
        }

        let session_ref: &SessionState = session;
        let futures = pending.iter().map(|branch| {
            let start = state
                .branch_states
                .get(&branch.id)
                .cloned()
                .unwrap_or_default();
            async move {
                ctx.emit(
                    session_ref,
                    EventKind::BranchStart,
                    json!({"branch_id": branch.id}),
                );
                (branch.id.clone(), run_branch(ctx, session_ref, branch, start).await)
            }
        });
        let results = join_all(futures).await;

        let mut pause: Option<HitlState> = None;
        let mut failure: Option<EngineError> = None;
        for (branch_id, run) in results {
            match run {
                BranchRun::Done(chain) => {
                    let response = chain
                        .step_history
                        .last()
                        .map(|record| record.response.clone())
                        .unwrap_or_default();
                    state
                        .branch_outputs
                        .insert(branch_id.clone(), TaskOutput::ok(response, branch_tokens(&chain)));
                    state.branch_states.shift_remove(&branch_id);
                    state.completed_branches.push(branch_id.clone());
                    ctx.emit(
                        session,
                        EventKind::BranchComplete,
                        json!({"branch_id": branch_id}),
                    );
                }
                BranchRun::Paused(chain, hitl) => {
                    state.branch_states.insert(branch_id, chain);
                    if pause.is_none() {
                        pause = Some(hitl);
                    }
                }
                BranchRun::Failed(chain, error) => {
                    state.branch_states.shift_remove(&branch_id);
                    state.branch_outputs.insert(
                        branch_id.clone(),
                        TaskOutput {
                            response: String::new(),
                            tokens: branch_tokens(&chain),
                            error: Some(error.to_string()),
                        },
                    );
                    state.completed_branches.push(branch_id);
                    if failure.is_none() {
                        failure = Some(error);
                    }
                }
            }
        }

        if let Some(hitl) = pause {
            // Siblings have drained; one checkpoint for the pause.
            state.hitl_state = Some(hitl.clone());
            store_state(session, &state)?;
            session.token_usage = ctx.meter.snapshot();

            match ctx.pause_for_hitl(session, &hitl)? {
                Some(response) => {
                    let branch_id = hitl.branch_id.clone().unwrap_or_default();
                    if let Some(chain) = state.branch_states.get_mut(&branch_id) {
                        inject_chain_response(chain, &response);
                    }
                    if let Some(h) = state.hitl_state.as_mut() {
                        h.active = false;
                        h.user_response = Some(response.clone());
                    }
                    store_state(session, &state)?;
                    ctx.save_session(session)?;
                    continue;
                }
                None => return Ok(Outcome::Paused { prompt: hitl.prompt }),
            }
        }

        if let Some(error) = failure {
            if config.reduce.is_none() {
                store_state(session, &state)?;
                session.token_usage = ctx.meter.snapshot();
                ctx.save_session(session)?;
                return Err(error);
            }
        }
    }

    store_state(session, &state)?;
    session.token_usage = ctx.meter.snapshot();
    ctx.save_session(session)?;

    // Optional review gate between branches and reduce.
    if let Some(review) = &config.review {
        let answered = state
            .hitl_state
            .as_ref()
            .map(|h| {
                !h.active
                    && h.step_type == Some(HitlStepType::Reduce)
                    && h.user_response.is_some()
            })
            .unwrap_or(false);
        if !answered && !state.reduce_done {
            let mut context = ctx.base_context(session);
            crate::patterns::merge_context(&mut context, &branches_context(&state));
            let prompt = template::render(&review.prompt, &context)?;
            let context_display = review
                .context_display
                .as_deref()
                .map(|display| template::render_permissive(display, &context))
                .transpose()?;
            let mut hitl = HitlState::new(prompt)
                .with_context_display(context_display)
                .with_default_response(review.default.clone())
                .with_timeout(review.timeout, Utc::now());
            hitl.step_type = Some(HitlStepType::Reduce);

            state.hitl_state = Some(hitl.clone());
            store_state(session, &state)?;
            match ctx.pause_for_hitl(session, &hitl)? {
                Some(response) => {
                    if let Some(h) = state.hitl_state.as_mut() {
                        h.active = false;
                        h.user_response = Some(response);
                    }
                    store_state(session, &state)?;
                    ctx.save_session(session)?;
                }
                None => return Ok(Outcome::Paused { prompt: hitl.prompt }),
            }
        }
    }

    // Reduce step.
    if let Some(reduce) = &config.reduce {
        if !state.reduce_done {
            let mut context = ctx.base_context(session);
            crate::patterns::merge_context(&mut context, &branches_context(&state));
            if let Some(map) = context.as_object_mut() {
                let hitl_response = state
                    .hitl_state
                    .as_ref()
                    .and_then(|h| h.user_response.clone())
                    .map(Value::String)
                    .unwrap_or(Value::Null);
                map.insert("hitl_response".to_string(), hitl_response);
            }
            let prompt = template::render(&reduce.input, &context)?;
            let record = ctx.invoke(session, &reduce.agent, None, None, &prompt).await?;

            state.reduce_output = Some(record.text);
            state.reduce_done = true;
            store_state(session, &state)?;
            session.token_usage = ctx.meter.snapshot();
            ctx.save_session(session)?;
        }
    }

    let last_response = state
        .reduce_output
        .clone()
        .unwrap_or_else(|| synthesized_response(&state));
    Ok(Outcome::Completed {
        last_response: Some(last_response),
    })
}
