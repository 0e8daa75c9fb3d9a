//! Chain executor: totally ordered steps with HITL pause/resume.
//!
//! The step loop is shared with the routing executor, which runs a
//! chosen route's steps under the same rules with its state stored in
//! the routing slot.

use chrono::Utc;
use serde_json::{json, Value};

use weave_models::error::{EngineError, Result};
use weave_models::session::{ChainState, HitlState, PatternState, SessionState, StepRecord};
use weave_models::spec::{ChainStep, PatternConfig, PatternType};
use weave_models::EventKind;

use crate::context::ExecutionContext;
use crate::patterns::{merge_context, state_mismatch, Outcome, ResumeMode};
use crate::template;

/// Where a chain-shaped state lives inside the session.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ChainSlot {
    Chain,
    Routing,
}

pub(crate) fn store_chain(
    session: &mut SessionState,
    slot: ChainSlot,
    chain: &ChainState,
) -> Result<()> {
    match (&mut session.pattern_state, slot) {
        (PatternState::Chain(state), ChainSlot::Chain) => {
            *state = chain.clone();
            Ok(())
        }
        (PatternState::Routing(state), ChainSlot::Routing) => {
            state.routed = Some(chain.clone());
            Ok(())
        }
        _ => Err(state_mismatch(session.metadata.pattern_type)),
    }
}

/// Record a HITL answer: the gate becomes a history entry and the next
/// step is the successor.
pub(crate) fn inject_chain_response(chain: &mut ChainState, response: &str) {
    let Some(hitl) = chain.hitl_state.as_mut() else {
        return;
    };
    if !hitl.active {
        return;
    }
    let index = hitl.step_index.unwrap_or(chain.current_step);
    hitl.active = false;
    hitl.user_response = Some(response.to_string());
    chain.step_history.push(StepRecord {
        index,
        agent: "hitl".to_string(),
        response: response.to_string(),
        tokens_estimated: 0,
    });
    chain.current_step = index + 1;
}

/// Template context for one chain step.
pub(crate) fn chain_context(
    ctx: &ExecutionContext,
    session: &SessionState,
    chain: &ChainState,
    extra: &Value,
) -> Value {
    let mut context = ctx.base_context(session);
    merge_context(&mut context, extra);
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
        let hitl_response = chain
            .step_history
            .iter()
            .rev()
            .find(|record| record.agent == "hitl")
            .map(|record| Value::String(record.response.clone()))
            .unwrap_or(Value::Null);
        map.insert("hitl_response".to_string(), hitl_response);
    }
    context
}

fn hitl_state_for_step(
    context: &Value,
    step: &ChainStep,
    index: usize,
) -> Result<HitlState> {
    let prompt = template::render(step.prompt.as_deref().unwrap_or("Continue?"), context)?;
    let context_display = step
        .context_display
        .as_deref()
        .map(|display| template::render_permissive(display, context))
        .transpose()?;
    let mut hitl = HitlState::new(prompt)
        .with_context_display(context_display)
        .with_default_response(step.default.clone())
        .with_timeout(step.timeout, Utc::now());
    hitl.step_index = Some(index);
    Ok(hitl)
}

/// Run `steps` from `chain.current_step` onward, checkpointing after
/// every step with `current_step` already advanced to the successor.
pub(crate) async fn run_steps(
    ctx: &ExecutionContext,
    session: &mut SessionState,
    steps: &[ChainStep],
    mut chain: ChainState,
    slot: ChainSlot,
    extra: Value,
) -> Result<Outcome> {
    let mut index = chain.current_step;
    while index < steps.len() {
        ctx.check_cancelled()?;
        let step = &steps[index];
        let context = chain_context(ctx, session, &chain, &extra);

        if step.is_hitl() {
            let hitl = hitl_state_for_step(&context, step, index)?;
            chain.current_step = index;
            chain.hitl_state = Some(hitl.clone());
            store_chain(session, slot, &chain)?;
            session.token_usage = ctx.meter.snapshot();

            match ctx.pause_for_hitl(session, &hitl)? {
                Some(response) => {
                    inject_chain_response(&mut chain, &response);
                    store_chain(session, slot, &chain)?;
                    ctx.save_session(session)?;
                    index = chain.current_step;
                    continue;
                }
                None => return Ok(Outcome::Paused { prompt: hitl.prompt }),
            }
        }

        let agent_id = step
            .agent
            .clone()
            .ok_or_else(|| EngineError::Validation(format!("step {index} has no agent")))?;
        ctx.emit(
            session,
            EventKind::StepStart,
            json!({"index": index, "agent": agent_id}),
        );

        let prompt = template::render(step.template(), &context)?;
        let record = ctx
            .invoke(session, &agent_id, step.tools.as_deref(), None, &prompt)
            .await?;

        chain.step_history.push(StepRecord {
            index,
            agent: agent_id.clone(),
            response: record.text.clone(),
            tokens_estimated: record.tokens(),
        });
        chain.current_step = index + 1;
        chain.hitl_state = None;
        store_chain(session, slot, &chain)?;
        session.token_usage = ctx.meter.snapshot();
        ctx.save_session(session)?;

        ctx.emit(
            session,
            EventKind::StepComplete,
            json!({
                "index": index,
                "agent": agent_id,
                "tokens": record.tokens(),
                "step_duration_s": record.step_duration_s,
            }),
        );
        index += 1;
    }

    Ok(Outcome::Completed {
        last_response: chain
            .step_history
            .last()
            .map(|record| record.response.clone()),
    })
}

/// Top-level chain executor.
pub async fn run(
    ctx: &ExecutionContext,
    session: &mut SessionState,
    mode: ResumeMode,
) -> Result<Outcome> {
    let PatternConfig::Chain(config) = &ctx.spec.config else {
        return Err(state_mismatch(PatternType::Chain));
    };
    let PatternState::Chain(state) = &session.pattern_state else {
        return Err(state_mismatch(PatternType::Chain));
    };
    let mut chain = state.clone();

    if let Some(hitl) = chain.hitl_state.as_ref().filter(|h| h.active) {
        let Some(response) = mode.hitl_response() else {
            return Err(EngineError::WaitingForHitl(format!(
                "session {} is paused at step {}",
                session.session_id(),
                hitl.step_index.unwrap_or(chain.current_step)
            )));
        };
        inject_chain_response(&mut chain, response);
        store_chain(session, ChainSlot::Chain, &chain)?;
        ctx.save_session(session)?;
    }

    run_steps(ctx, session, &config.steps, chain, ChainSlot::Chain, json!({})).await
}
