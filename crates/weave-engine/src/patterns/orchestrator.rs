//! Orchestrator-workers executor: a planner decomposes the goal, a
//! bounded worker pool executes each round's tasks concurrently, and the
//! planner decides whether to continue. Optional reduce and writeup
//! steps synthesize the final deliverable.

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use tracing::warn;

use weave_models::error::{EngineError, Result};
use weave_models::session::{
    HitlState, OrchestratorPhase, OrchestratorState, PatternState, PlannedTask, RoundRecord,
    SessionState, WorkerOutput,
};
use weave_models::spec::{PatternConfig, PatternType, ReviewGateDef};
use weave_models::EventKind;

use crate::context::ExecutionContext;
use crate::patterns::{merge_context, state_mismatch, Outcome, ResumeMode};
use crate::template;

fn store_state(session: &mut SessionState, state: &OrchestratorState) -> Result<()> {
    match &mut session.pattern_state {
        PatternState::OrchestratorWorkers(slot) => {
            *slot = state.clone();
            Ok(())
        }
        _ => Err(state_mismatch(PatternType::OrchestratorWorkers)),
    }
}

/// Pull the first balanced JSON array out of a planner reply.
fn extract_json_array(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_array() {
            return Some(value);
        }
    }

    let start = trimmed.find('[')?;
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
            '[' if !in_string => depth += 1,
            ']' if !in_string => {
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

/// Parse a plan: an array of `{description, context?}` objects (bare
/// strings are accepted as descriptions).
fn parse_plan(text: &str) -> Option<Vec<PlannedTask>> {
    let array = extract_json_array(text)?;
    let items = array.as_array()?;
    let mut plan = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(description) => plan.push(PlannedTask {
                description: description.clone(),
                context: None,
            }),
            Value::Object(map) => {
                let description = map.get("description")?.as_str()?.to_string();
                let context = map
                    .get("context")
                    .and_then(|c| c.as_str())
                    .map(|c| c.to_string());
                plan.push(PlannedTask {
                    description,
                    context,
                });
            }
            _ => return None,
        }
    }
    if plan.is_empty() {
        return None;
    }
    Some(plan)
}

fn parse_decision(text: &str) -> Option<String> {
    let value = crate::patterns::extract_json_object(text)?;
    value
        .get("decision")
        .and_then(|d| d.as_str())
        .map(|d| d.to_lowercase())
}

fn all_worker_outputs(state: &OrchestratorState) -> Vec<&WorkerOutput> {
    state
        .rounds
        .iter()
        .flat_map(|round| round.worker_outputs.iter())
        .collect()
}

fn gate_hitl(
    gate: &ReviewGateDef,
    context: &Value,
    round: u32,
    gate_name: &str,
) -> Result<HitlState> {
    let prompt = template::render(&gate.prompt, context)?;
    let context_display = gate
        .context_display
        .as_deref()
        .map(|display| template::render_permissive(display, context))
        .transpose()?;
    let mut hitl = HitlState::new(prompt)
        .with_context_display(context_display)
        .with_default_response(gate.default.clone())
        .with_timeout(gate.timeout, Utc::now());
    hitl.round = Some(round);
    hitl.gate = Some(gate_name.to_string());
    Ok(hitl)
}

pub async fn run(
    ctx: &ExecutionContext,
    session: &mut SessionState,
    mode: ResumeMode,
) -> Result<Outcome> {
    let PatternConfig::OrchestratorWorkers(config) = &ctx.spec.config else {
        return Err(state_mismatch(PatternType::OrchestratorWorkers));
    };
    let PatternState::OrchestratorWorkers(existing) = &session.pattern_state else {
        return Err(state_mismatch(PatternType::OrchestratorWorkers));
    };
    let mut state = existing.clone();
    let limits = config.orchestrator.limits();

    // Resume injection for either review gate.
    if let Some(hitl) = state.hitl_state.clone().filter(|h| h.active) {
        let Some(response) = mode.hitl_response() else {
            return Err(EngineError::WaitingForHitl(format!(
                "session {} is paused at the {} gate",
                session.session_id(),
                hitl.gate.as_deref().unwrap_or("review")
            )));
        };
        if hitl.gate.as_deref() == Some("decomposition_review") {
            // The reviewer may replace the plan with raw JSON.
            if let Some(edited) = parse_plan(response) {
                if let Some(round) = state.rounds.last_mut() {
                    round.plan = edited;
                }
            }
        }
        if let Some(h) = state.hitl_state.as_mut() {
            h.active = false;
            h.user_response = Some(response.to_string());
        }
        store_state(session, &state)?;
        ctx.save_session(session)?;
    }

    loop {
        ctx.check_cancelled()?;
        match state.phase {
            OrchestratorPhase::Plan => {
                if state.current_round >= limits.max_rounds {
                    state.phase = OrchestratorPhase::Reduce;
                    store_state(session, &state)?;
                    ctx.save_session(session)?;
                    continue;
                }
                let round_number = state.current_round + 1;

                let mut context = ctx.base_context(session);
                merge_context(
                    &mut context,
                    &json!({"round": round_number, "rounds": state.rounds}),
                );
                let mut prompt = template::render(&config.orchestrator.input, &context)?;
                if !state.rounds.is_empty() {
                    prompt.push_str(&format!(
                        "\n\nPrior rounds:\n{}\n\nPlan the next round of tasks as a JSON array \
                         of {{\"description\", \"context\"}} objects.",
                        serde_json::to_string(&state.rounds).unwrap_or_default()
                    ));
                }

                let mut plan = None;
                for attempt in 0..2 {
                    let reply = ctx
                        .invoke(session, &config.orchestrator.agent, None, None, &prompt)
                        .await?;
                    state.orchestrator_response = Some(reply.text.clone());
                    match parse_plan(&reply.text) {
                        Some(parsed) => {
                            plan = Some(parsed);
                            break;
                        }
                        None if attempt == 0 => {
                            warn!(round = round_number, "unparseable plan, reprompting once");
                            prompt = format!(
                                "Reply with ONLY a JSON array of {{\"description\", \"context\"}} \
                                 task objects.\n\n{prompt}"
                            );
                        }
                        None => {}
                    }
                }
                let mut plan = plan.ok_or_else(|| {
                    EngineError::Provider(format!(
                        "orchestrator produced no valid task plan in round {round_number}"
                    ))
                })?;
                plan.truncate(limits.max_workers);

                state.rounds.push(RoundRecord {
                    round: round_number,
                    plan,
                    worker_outputs: Vec::new(),
                });
                state.phase = OrchestratorPhase::Workers;
                store_state(session, &state)?;
                session.token_usage = ctx.meter.snapshot();
                ctx.save_session(session)?;
                ctx.emit(
                    session,
                    EventKind::StepComplete,
                    json!({"phase": "plan", "round": round_number}),
                );

                if let Some(gate) = &config.decomposition_review {
                    let mut gate_context = ctx.base_context(session);
                    merge_context(
                        &mut gate_context,
                        &json!({"round": round_number, "plan": state.rounds.last().map(|r| &r.plan)}),
                    );
                    let hitl =
                        gate_hitl(gate, &gate_context, round_number, "decomposition_review")?;
                    state.hitl_state = Some(hitl.clone());
                    store_state(session, &state)?;

                    match ctx.pause_for_hitl(session, &hitl)? {
                        Some(response) => {
                            if let Some(edited) = parse_plan(&response) {
                                if let Some(round) = state.rounds.last_mut() {
                                    round.plan = edited;
                                }
                            }
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

            OrchestratorPhase::Workers => {
                let round_number = state.current_round + 1;
                let plan = state
                    .rounds
                    .last()
                    .map(|round| round.plan.clone())
                    .unwrap_or_default();

                let session_ref: &SessionState = session;
                let worker_agent = config.worker_template.agent.clone();
                let worker_tools = config.worker_template.tools.clone();
                let futures = plan.iter().enumerate().map(|(index, task)| {
                    let worker_agent = worker_agent.clone();
                    let worker_tools = worker_tools.clone();
                    async move {
                        ctx.emit(
                            session_ref,
                            EventKind::TaskStart,
                            json!({"round": round_number, "worker": index, "task": task.description}),
                        );
                        let mut prompt = task.description.clone();
                        if let Some(task_context) = &task.context {
                            prompt.push_str("\n\nContext:\n");
                            prompt.push_str(task_context);
                        }
                        let record = ctx
                            .invoke(
                                session_ref,
                                &worker_agent,
                                worker_tools.as_deref(),
                                Some(index),
                                &prompt,
                            )
                            .await?;
                        let tokens = record.tokens();
                        Ok::<_, EngineError>(WorkerOutput {
                            task: task.description.clone(),
                            response: record.text,
                            tokens,
                        })
                    }
                });

                let results = join_all(futures).await;
                let mut outputs = Vec::with_capacity(results.len());
                for result in results {
                    outputs.push(result?);
                }
                for output in &outputs {
                    ctx.emit(
                        session,
                        EventKind::TaskComplete,
                        json!({"round": round_number, "task": output.task, "tokens": output.tokens}),
                    );
                }
                if let Some(round) = state.rounds.last_mut() {
                    round.worker_outputs = outputs;
                }

                // Completed this round; decide whether another follows.
                state.current_round += 1;
                let decision = if state.current_round >= limits.max_rounds {
                    "complete".to_string()
                } else {
                    let decide_prompt = format!(
                        "Worker results for round {round_number}:\n{}\n\nReply with JSON \
                         {{\"decision\": \"continue\"}} to plan another round, or \
                         {{\"decision\": \"complete\"}} if the goal is met.",
                        serde_json::to_string(
                            &state.rounds.last().map(|r| &r.worker_outputs)
                        )
                        .unwrap_or_default()
                    );
                    let reply = ctx
                        .invoke(session, &config.orchestrator.agent, None, None, &decide_prompt)
                        .await?;
                    state.orchestrator_response = Some(reply.text.clone());
                    parse_decision(&reply.text).unwrap_or_else(|| "complete".to_string())
                };

                state.phase = if decision == "continue" {
                    OrchestratorPhase::Plan
                } else {
                    OrchestratorPhase::Reduce
                };
                store_state(session, &state)?;
                session.token_usage = ctx.meter.snapshot();
                ctx.save_session(session)?;
            }

            OrchestratorPhase::Reduce => {
                if let Some(gate) = &config.reduce_review {
                    let answered = state
                        .hitl_state
                        .as_ref()
                        .map(|h| {
                            !h.active
                                && h.gate.as_deref() == Some("reduce_review")
                                && h.user_response.is_some()
                        })
                        .unwrap_or(false);
                    if !answered && !state.reduce_done {
                        let mut gate_context = ctx.base_context(session);
                        merge_context(
                            &mut gate_context,
                            &json!({"workers": all_worker_outputs(&state)}),
                        );
                        let hitl =
                            gate_hitl(gate, &gate_context, state.current_round, "reduce_review")?;
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

                if let Some(reduce) = &config.reduce {
                    if !state.reduce_done {
                        let mut context = ctx.base_context(session);
                        merge_context(
                            &mut context,
                            &json!({
                                "workers": all_worker_outputs(&state),
                                "rounds": state.rounds,
                                "orchestrator_response": state.orchestrator_response,
                                "hitl_response": state
                                    .hitl_state
                                    .as_ref()
                                    .and_then(|h| h.user_response.clone()),
                            }),
                        );
                        let prompt = template::render(&reduce.input, &context)?;
                        let record = ctx
                            .invoke(session, &reduce.agent, None, None, &prompt)
                            .await?;
                        state.reduce_output = Some(record.text);
                    }
                }
                state.reduce_done = true;
                state.phase = OrchestratorPhase::Writeup;
                store_state(session, &state)?;
                session.token_usage = ctx.meter.snapshot();
                ctx.save_session(session)?;
            }

            OrchestratorPhase::Writeup => {
                if let Some(writeup) = &config.writeup {
                    if !state.writeup_done {
                        let mut context = ctx.base_context(session);
                        merge_context(
                            &mut context,
                            &json!({
                                "workers": all_worker_outputs(&state),
                                "rounds": state.rounds,
                                "orchestrator_response": state.orchestrator_response,
                                "reduce_response": state.reduce_output,
                            }),
                        );
                        let prompt = template::render(&writeup.input, &context)?;
                        let record = ctx
                            .invoke(session, &writeup.agent, None, None, &prompt)
                            .await?;
                        state.writeup_output = Some(record.text);
                    }
                }
                state.writeup_done = true;
                state.phase = OrchestratorPhase::Done;
                store_state(session, &state)?;
                session.token_usage = ctx.meter.snapshot();
                ctx.save_session(session)?;
            }

            OrchestratorPhase::Done => break,
        }
    }

    let last_response = state
        .writeup_output
        .clone()
        .or_else(|| state.reduce_output.clone())
        .or_else(|| {
            let outputs = all_worker_outputs(&state);
            if outputs.is_empty() {
                state.orchestrator_response.clone()
            } else {
                Some(
                    outputs
                        .iter()
                        .map(|output| output.response.as_str())
                        .collect::<Vec<_>>()
                        .join("\n\n"),
                )
            }
        });

    Ok(Outcome::Completed { last_response })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parsing_accepts_objects_and_strings() {
        let plan = parse_plan(r#"[{"description": "t1"}, {"description": "t2", "context": "c"}]"#)
            .unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].context.as_deref(), Some("c"));

        let strings = parse_plan(r#"["alpha", "beta"]"#).unwrap();
        assert_eq!(strings[0].description, "alpha");
    }

    #[test]
    fn plan_parsing_finds_embedded_arrays() {
        let plan = parse_plan("Sure:\n[{\"description\": \"x\"}]\ndone").unwrap();
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn plan_parsing_rejects_garbage() {
        assert!(parse_plan("no array here").is_none());
        assert!(parse_plan("[]").is_none());
        assert!(parse_plan("[42]").is_none());
    }

    #[test]
    fn decision_parsing() {
        assert_eq!(
            parse_decision(r#"{"decision": "continue", "reason": "more"}"#).as_deref(),
            Some("continue")
        );
        assert_eq!(
            parse_decision("done: {\"decision\": \"COMPLETE\"}").as_deref(),
            Some("complete")
        );
        assert!(parse_decision("finished").is_none());
    }
}
