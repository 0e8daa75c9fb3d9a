//! Workflow (DAG) executor: dependency layers run concurrently under the
//! run semaphore; a HITL task pauses the layer after in-flight siblings
//! drain.

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};

use weave_models::error::{EngineError, Result};
use weave_models::session::{
    HitlState, PatternState, SessionState, TaskOutput, WorkflowState,
};
use weave_models::spec::{PatternConfig, PatternType, TaskDef};
use weave_models::EventKind;

use crate::context::ExecutionContext;
use crate::patterns::{state_mismatch, Outcome, ResumeMode};
use crate::template;
use crate::validate;

fn store_state(session: &mut SessionState, state: &WorkflowState) -> Result<()> {
    match &mut session.pattern_state {
        PatternState::Workflow(slot) => {
            *slot = state.clone();
            Ok(())
        }
        _ => Err(state_mismatch(PatternType::Workflow)),
    }
}

fn dag_context(ctx: &ExecutionContext, session: &SessionState, state: &WorkflowState) -> Value {
    let mut context = ctx.base_context(session);
    if let Some(map) = context.as_object_mut() {
        map.insert(
            "tasks".to_string(),
            serde_json::to_value(&state.task_outputs).unwrap_or_default(),
        );
    }
    context
}

fn inject_task_response(state: &mut WorkflowState, response: &str) {
    let Some(hitl) = state.hitl_state.as_mut() else {
        return;
    };
    if !hitl.active {
        return;
    }
    hitl.active = false;
    hitl.user_response = Some(response.to_string());
    if let Some(task_id) = hitl.task_id.clone() {
        state
            .task_outputs
            .insert(task_id.clone(), TaskOutput::ok(response, 0));
        if !state.completed_tasks.contains(&task_id) {
            state.completed_tasks.push(task_id);
        }
    }
}

pub async fn run(
    ctx: &ExecutionContext,
    session: &mut SessionState,
    mode: ResumeMode,
) -> Result<Outcome> {
    let PatternConfig::Workflow(config) = &ctx.spec.config else {
        return Err(state_mismatch(PatternType::Workflow));
    };
    let PatternState::Workflow(existing) = &session.pattern_state else {
        return Err(state_mismatch(PatternType::Workflow));
    };
    let mut state = existing.clone();

    // Dependency resolution happens once, before any invocation.
    if state.layers.is_empty() {
        state.layers = validate::dag_layers(config)?;
        state.current_layer = 0;
        store_state(session, &state)?;
        ctx.save_session(session)?;
    }

    if let Some(hitl) = state.hitl_state.as_ref().filter(|h| h.active) {
        let Some(response) = mode.hitl_response() else {
            return Err(EngineError::WaitingForHitl(format!(
                "session {} is paused at task '{}'",
                session.session_id(),
                hitl.task_id.as_deref().unwrap_or("?")
            )));
        };
        inject_task_response(&mut state, response);
        store_state(session, &state)?;
        ctx.save_session(session)?;
    }

    let layers = state.layers.clone();
    let mut layer_index = state.current_layer;
    while layer_index < layers.len() {
        loop {
            ctx.check_cancelled()?;

            let remaining: Vec<TaskDef> = layers[layer_index]
                .iter()
                .filter(|id| !state.completed_tasks.contains(*id))
                .map(|id| {
                    config
                        .tasks
                        .iter()
                        .find(|task| &task.id == id)
                        .cloned()
                        .ok_or_else(|| {
                            EngineError::Validation(format!("unknown task '{id}' in layer"))
                        })
                })
                .collect::<Result<_>>()?;
            if remaining.is_empty() {
                break;
            }

            let agent_tasks: Vec<TaskDef> =
                remaining.iter().filter(|t| !t.is_hitl()).cloned().collect();
            let hitl_tasks: Vec<TaskDef> =
                remaining.iter().filter(|t| t.is_hitl()).cloned().collect();

            if !agent_tasks.is_empty() {
                let context = dag_context(ctx, session, &state);
                let session_ref: &SessionState = session;

                let futures = agent_tasks.iter().map(|task| {
                    let context = &context;
                    async move {
                        ctx.emit(
                            session_ref,
                            EventKind::TaskStart,
                            json!({"task_id": task.id, "layer": layer_index}),
                        );
                        let prompt = template::render(task.template(), context)?;
                        let agent_id = task.agent.as_deref().ok_or_else(|| {
                            EngineError::Validation(format!("task '{}' has no agent", task.id))
                        })?;
                        let record = ctx
                            .invoke(session_ref, agent_id, task.tools.as_deref(), None, &prompt)
                            .await?;
                        Ok::<_, EngineError>((task.id.clone(), record))
                    }
                });

                // The layer completes only when every sibling finishes;
                // completion order within it is unspecified.
                let results = join_all(futures).await;
                let mut first_error = None;
                for result in results {
                    match result {
                        Ok((task_id, record)) => {
                            state
                                .task_outputs
                                .insert(task_id.clone(), TaskOutput::ok(&record.text, record.tokens()));
                            state.completed_tasks.push(task_id.clone());
                            ctx.emit(
                                session,
                                EventKind::TaskComplete,
                                json!({
                                    "task_id": task_id,
                                    "layer": layer_index,
                                    "tokens": record.tokens(),
                                }),
                            );
                        }
                        Err(error) => {
                            if first_error.is_none() {
                                first_error = Some(error);
                            }
                        }
                    }
                }
                if let Some(error) = first_error {
                    store_state(session, &state)?;
                    session.token_usage = ctx.meter.snapshot();
                    ctx.save_session(session)?;
                    return Err(error);
                }
            }

            if let Some(task) = hitl_tasks.first() {
                let context = dag_context(ctx, session, &state);
                let prompt =
                    template::render(task.prompt.as_deref().unwrap_or("Continue?"), &context)?;
                let context_display = task
                    .context_display
                    .as_deref()
                    .map(|display| template::render_permissive(display, &context))
                    .transpose()?;
                let mut hitl = HitlState::new(prompt)
                    .with_context_display(context_display)
                    .with_default_response(task.default.clone())
                    .with_timeout(task.timeout, Utc::now());
                hitl.task_id = Some(task.id.clone());
                hitl.layer_index = Some(layer_index);

                state.hitl_state = Some(hitl.clone());
                state.current_layer = layer_index;
                store_state(session, &state)?;
                session.token_usage = ctx.meter.snapshot();

                match ctx.pause_for_hitl(session, &hitl)? {
                    Some(response) => {
                        inject_task_response(&mut state, &response);
                        store_state(session, &state)?;
                        ctx.save_session(session)?;
                        continue;
                    }
                    None => return Ok(Outcome::Paused { prompt: hitl.prompt }),
                }
            }

            store_state(session, &state)?;
        }

        // Advance to the successor layer before the checkpoint.
        layer_index += 1;
        state.current_layer = layer_index;
        store_state(session, &state)?;
        session.token_usage = ctx.meter.snapshot();
        ctx.save_session(session)?;
    }

    let last_response = layers
        .iter()
        .flatten()
        .filter_map(|id| state.task_outputs.get(id))
        .filter(|output| output.error.is_none())
        .next_back()
        .map(|output| output.response.clone());

    Ok(Outcome::Completed { last_response })
}
