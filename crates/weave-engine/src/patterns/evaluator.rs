//! Evaluator-optimizer executor: producer/evaluator iteration loop with
//! a score gate and an optional human review between iterations.

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use weave_models::error::{EngineError, Result};
use weave_models::session::{
    EvaluatorState, HitlState, IterationRecord, PatternState, SessionState,
};
use weave_models::spec::{PatternConfig, PatternType};
use weave_models::EventKind;

use crate::context::ExecutionContext;
use crate::patterns::{merge_context, state_mismatch, Outcome, ResumeMode};
use crate::template;

const DEFAULT_REVISE_PROMPT: &str = "Revise your previous answer using the feedback.\n\n\
Previous output:\n{{ previous_output }}\n\nFeedback:\n{{ feedback }}";

/// The accepted verdict shape. Looser evaluator replies are rejected
/// and retried once.
#[derive(Debug, Clone, serde::Deserialize)]
struct Verdict {
    score: i64,
    feedback: String,
    #[serde(default)]
    #[allow(dead_code)]
    issues: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    suggestions: Vec<String>,
}

fn parse_verdict(text: &str) -> Option<Verdict> {
    let value = crate::patterns::extract_json_object(text)?;
    let verdict: Verdict = serde_json::from_value(value).ok()?;
    if !(0..=100).contains(&verdict.score) {
        return None;
    }
    Some(verdict)
}

fn store_state(session: &mut SessionState, state: &EvaluatorState) -> Result<()> {
    match &mut session.pattern_state {
        PatternState::EvaluatorOptimizer(slot) => {
            *slot = state.clone();
            Ok(())
        }
        _ => Err(state_mismatch(PatternType::EvaluatorOptimizer)),
    }
}

pub async fn run(
    ctx: &ExecutionContext,
    session: &mut SessionState,
    mode: ResumeMode,
) -> Result<Outcome> {
    let PatternConfig::EvaluatorOptimizer(config) = &ctx.spec.config else {
        return Err(state_mismatch(PatternType::EvaluatorOptimizer));
    };
    let PatternState::EvaluatorOptimizer(existing) = &session.pattern_state else {
        return Err(state_mismatch(PatternType::EvaluatorOptimizer));
    };
    let mut state = existing.clone();

    if let Some(hitl) = state.hitl_state.as_ref().filter(|h| h.active) {
        let Some(response) = mode.hitl_response() else {
            return Err(EngineError::WaitingForHitl(format!(
                "session {} is paused at the iteration-{} review gate",
                session.session_id(),
                hitl.iteration.unwrap_or_default()
            )));
        };
        if let Some(h) = state.hitl_state.as_mut() {
            h.active = false;
            h.user_response = Some(response.to_string());
        }
        store_state(session, &state)?;
        ctx.save_session(session)?;
    }

    while state.current_iteration < config.accept.max_iters {
        ctx.check_cancelled()?;
        let iteration = state.current_iteration;
        let display_iter = iteration + 1;
        ctx.emit(
            session,
            EventKind::StepStart,
            json!({"iteration": display_iter, "agent": config.producer}),
        );

        // Produce.
        let mut context = ctx.base_context(session);
        let previous = state.iterations.last();
        merge_context(
            &mut context,
            &json!({
                "iteration": display_iter,
                "previous_output": previous.map(|r| r.output.clone()),
                "feedback": previous.and_then(|r| r.feedback.clone()),
                "hitl_response": state
                    .hitl_state
                    .as_ref()
                    .and_then(|h| h.user_response.clone()),
            }),
        );

        let producer_prompt = if iteration == 0 {
            template::render(&config.input, &context)?
        } else {
            let revise = config
                .revise_prompt
                .as_deref()
                .unwrap_or(DEFAULT_REVISE_PROMPT);
            template::render_permissive(revise, &context)?
        };
        let output = ctx
            .invoke(session, &config.producer, None, None, &producer_prompt)
            .await?
            .text;

        // Evaluate, with one retry on an unparseable verdict.
        let mut eval_context = ctx.base_context(session);
        merge_context(
            &mut eval_context,
            &json!({"output": output, "iteration": display_iter}),
        );
        let eval_prompt = template::render(&config.evaluator.input, &eval_context)?;

        let mut verdict = None;
        for eval_attempt in 0..2 {
            let reply = ctx
                .invoke(session, &config.evaluator.agent, None, None, &eval_prompt)
                .await?
                .text;
            match parse_verdict(&reply) {
                Some(parsed) => {
                    verdict = Some(parsed);
                    break;
                }
                None if eval_attempt == 0 => {
                    warn!(iteration = display_iter, "evaluator verdict unparseable, retrying once");
                }
                None => {}
            }
        }
        let (score, feedback) = match verdict {
            Some(v) => (v.score, v.feedback),
            None => (0, "parse_error".to_string()),
        };

        state.iterations.push(IterationRecord {
            iter: display_iter,
            output: output.clone(),
            score: Some(score),
            feedback: Some(feedback.clone()),
        });

        ctx.emit(
            session,
            EventKind::StepComplete,
            json!({"iteration": display_iter, "score": score}),
        );

        if score >= config.accept.min_score {
            state.converged = true;
            state.current_iteration = display_iter;
            store_state(session, &state)?;
            session.token_usage = ctx.meter.snapshot();
            ctx.save_session(session)?;
            return Ok(Outcome::Completed {
                last_response: Some(output),
            });
        }

        // Optional human review between evaluation and the next revision.
        let exhausted = display_iter >= config.accept.max_iters;
        if let Some(gate) = &config.review_gate {
            if !exhausted {
                let mut gate_context = ctx.base_context(session);
                merge_context(
                    &mut gate_context,
                    &json!({"output": output, "score": score, "feedback": feedback, "iteration": display_iter}),
                );
                let prompt = template::render(&gate.prompt, &gate_context)?;
                let context_display = gate
                    .context_display
                    .as_deref()
                    .map(|display| template::render_permissive(display, &gate_context))
                    .transpose()?;
                let mut hitl = HitlState::new(prompt)
                    .with_context_display(context_display)
                    .with_default_response(gate.default.clone())
                    .with_timeout(gate.timeout, Utc::now());
                hitl.iteration = Some(display_iter);
                hitl.gate = Some("review_gate".to_string());

                // Successor first: the next unit is the following iteration.
                state.current_iteration = display_iter;
                state.hitl_state = Some(hitl.clone());
                store_state(session, &state)?;
                session.token_usage = ctx.meter.snapshot();

                match ctx.pause_for_hitl(session, &hitl)? {
                    Some(response) => {
                        if let Some(h) = state.hitl_state.as_mut() {
                            h.active = false;
                            h.user_response = Some(response);
                        }
                        store_state(session, &state)?;
                        ctx.save_session(session)?;
                        continue;
                    }
                    None => return Ok(Outcome::Paused { prompt: hitl.prompt }),
                }
            }
        }

        state.current_iteration = display_iter;
        store_state(session, &state)?;
        session.token_usage = ctx.meter.snapshot();
        ctx.save_session(session)?;
    }

    // Iterations exhausted without convergence: the best-scoring output
    // wins; convergence is advisory.
    let best = state
        .iterations
        .iter()
        .max_by_key(|record| record.score.unwrap_or(i64::MIN))
        .map(|record| record.output.clone());
    store_state(session, &state)?;
    ctx.save_session(session)?;
    Ok(Outcome::Completed {
        last_response: best,
    })
}
