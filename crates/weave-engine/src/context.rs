//! Shared execution context for one workflow run.
//!
//! Owns the semaphore bounding fan-out, the token meter, budget guards,
//! the cancellation flag, and the glue that builds cached agents and
//! invokes them with retry and budget accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tracing::debug;

use weave_ai::{
    invoke_with_retry, jit_instructions, Agent, AgentCache, AgentKey, ConversationLog,
    HookDescriptor, InvokeRecord, ModelPool, RetryPolicy, TokenMeter, ToolResolver,
};
use weave_models::error::{EngineError, Result};
use weave_models::session::{HitlState, SessionState, SessionStatus};
use weave_models::spec::{Budgets, WorkflowSpec};
use weave_models::{EventKind, RuntimeConfig, WorkflowEvent};
use weave_storage::SessionStore;

use crate::events::EventBus;

/// Synchronous human-in-the-loop handler. May block; the executor calls
/// it after the pause checkpoint is durably written.
pub trait HitlHandler: Send + Sync {
    fn respond(&self, hitl: &HitlState) -> String;
}

impl<F> HitlHandler for F
where
    F: Fn(&HitlState) -> String + Send + Sync,
{
    fn respond(&self, hitl: &HitlState) -> String {
        self(hitl)
    }
}

/// Warn once when cumulative tokens reach this share of the budget.
const BUDGET_WARNING_RATIO: f64 = 0.8;

pub struct ExecutionContext {
    pub spec: Arc<WorkflowSpec>,
    pub store: Option<SessionStore>,
    /// Whether checkpoints are written for non-pause saves.
    pub persist: bool,
    pub bus: Option<EventBus>,
    pub hitl_handler: Option<Arc<dyn HitlHandler>>,
    pub cache: Arc<AgentCache>,
    /// Engine-owned caches are closed on exit; caller-supplied ones are not.
    pub owns_cache: bool,
    pub pool: Arc<ModelPool>,
    pub resolver: Arc<ToolResolver>,
    pub meter: TokenMeter,
    pub semaphore: Arc<Semaphore>,
    pub retry_policy: RetryPolicy,
    steps_taken: AtomicU64,
    started: Instant,
    cancelled: watch::Receiver<bool>,
    budget_warned: AtomicBool,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spec: Arc<WorkflowSpec>,
        store: Option<SessionStore>,
        persist: bool,
        bus: Option<EventBus>,
        hitl_handler: Option<Arc<dyn HitlHandler>>,
        cache: Arc<AgentCache>,
        owns_cache: bool,
        pool: Arc<ModelPool>,
        resolver: Arc<ToolResolver>,
        cancelled: watch::Receiver<bool>,
    ) -> Self {
        let retry_policy = RetryPolicy::from_runtime(&spec.runtime);
        let semaphore = Arc::new(Semaphore::new(spec.runtime.max_parallel.max(1)));
        Self {
            spec,
            store,
            persist,
            bus,
            hitl_handler,
            cache,
            owns_cache,
            pool,
            resolver,
            meter: TokenMeter::new(),
            semaphore,
            retry_policy,
            steps_taken: AtomicU64::new(0),
            started: Instant::now(),
            cancelled,
            budget_warned: AtomicBool::new(false),
        }
    }

    pub fn budgets(&self) -> Budgets {
        self.spec.runtime.budgets()
    }

    pub fn emit(&self, session: &SessionState, kind: EventKind, data: Value) {
        if let Some(bus) = &self.bus {
            bus.emit(&WorkflowEvent::new(
                Some(session.session_id()),
                self.spec.name.clone(),
                self.spec.pattern_type,
                kind,
                data,
            ));
        }
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if *self.cancelled.borrow() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    /// Count one unit of work against `budgets.max_steps`. The attempt
    /// that reaches the ceiling is refused, matching the duration guard.
    pub fn charge_step(&self) -> Result<u64> {
        let taken = self.steps_taken.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(max_steps) = self.budgets().max_steps {
            if taken >= max_steps {
                return Err(EngineError::BudgetExceeded(format!(
                    "step count {taken} reached max_steps {max_steps}"
                )));
            }
        }
        Ok(taken)
    }

    pub fn steps_taken(&self) -> u64 {
        self.steps_taken.load(Ordering::SeqCst)
    }

    pub fn check_duration(&self) -> Result<()> {
        if let Some(max_duration_s) = self.budgets().max_duration_s {
            let elapsed = self.started.elapsed().as_secs();
            if elapsed >= max_duration_s {
                return Err(EngineError::BudgetExceeded(format!(
                    "run duration {elapsed}s reached max_duration_s {max_duration_s}"
                )));
            }
        }
        Ok(())
    }

    /// Persist the session when persistence is on.
    pub fn save_session(&self, session: &SessionState) -> Result<()> {
        if !self.persist {
            return Ok(());
        }
        self.force_save_session(session)
    }

    /// Persist unconditionally (pause checkpoints must survive even for
    /// otherwise-ephemeral runs).
    pub fn force_save_session(&self, session: &SessionState) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store
            .save(session, &self.spec.source_text, self.spec.source_format)
            .map_err(Into::into)
    }

    /// Base template context: inputs and variables at top level plus
    /// their namespaced forms.
    pub fn base_context(&self, session: &SessionState) -> Value {
        let mut map = serde_json::Map::new();
        for (key, value) in &self.spec.inputs.values {
            map.insert(key.clone(), value.clone());
        }
        for (key, value) in &session.variables {
            map.insert(key.clone(), value.clone());
        }
        let variables: Value = json!(session.variables);
        map.insert("variables".to_string(), variables);
        map.insert(
            "inputs".to_string(),
            json!({"values": self.spec.inputs.values}),
        );
        Value::Object(map)
    }

    /// Build (or fetch) the cached agent for a step.
    ///
    /// `instance` distinguishes otherwise-identical worker agents in a
    /// fan-out; it participates in the cache key and the conversation
    /// directory.
    pub async fn agent_instance(
        &self,
        session: &SessionState,
        agent_id: &str,
        step_tools: Option<&[String]>,
        instance: Option<usize>,
    ) -> Result<Arc<Agent>> {
        let agent_spec = self.spec.agent(agent_id)?.clone();

        let notes = self
            .spec
            .context_policy
            .as_ref()
            .and_then(|policy| policy.notes.clone());
        let jit_tools: Vec<String> = self
            .spec
            .context_policy
            .as_ref()
            .and_then(|policy| policy.retrieval.as_ref())
            .map(|retrieval| retrieval.jit_tools.clone())
            .unwrap_or_default();

        let hooks: Vec<HookDescriptor> = if self.hitl_handler.is_some() {
            vec![HookDescriptor::hitl_approval()]
        } else {
            Vec::new()
        };

        let session_handle = if self.persist && self.store.is_some() {
            let suffix = instance.map(|i| format!("_w{i}")).unwrap_or_default();
            Some(format!("{}_{agent_id}{suffix}", session.session_id()))
        } else {
            None
        };

        let descriptors = json!({
            "agent": agent_spec,
            "step_tools": step_tools,
            "hooks": hooks,
            "notes": notes,
            "jit_tools": jit_tools,
            "instance": instance,
        });
        let key = AgentKey::new(agent_id, &descriptors, session_handle.as_deref())
            .map_err(EngineError::from)?;

        let build = || async {
            let runtime_config = RuntimeConfig::for_agent(&self.spec.runtime, &agent_spec);
            let client = self.pool.get(&runtime_config)?;

            let mut system_prompt = agent_spec.prompt.clone();
            if let Some(notes) = &notes {
                system_prompt.push_str("\n\nNotes:\n");
                system_prompt.push_str(notes);
            }

            let mut tool_refs: Vec<String> = step_tools
                .map(|tools| tools.to_vec())
                .unwrap_or_else(|| agent_spec.tools.clone());
            for jit in &jit_tools {
                if !tool_refs.contains(jit) {
                    tool_refs.push(jit.clone());
                }
            }
            if !jit_tools.is_empty() {
                system_prompt.push_str("\n\n");
                system_prompt.push_str(&jit_instructions(&jit_tools));
            }
            let tools = self.resolver.resolve_all(&tool_refs)?;

            let mut builder = Agent::builder(agent_id, client)
                .with_system_prompt(system_prompt)
                .with_tools(tools)
                .with_hooks(hooks.clone())
                .with_inference(
                    agent_spec.temperature.or(self.spec.runtime.temperature),
                    agent_spec.top_p.or(self.spec.runtime.top_p),
                    agent_spec.max_tokens.or(self.spec.runtime.max_tokens),
                );

            if session_handle.is_some() {
                if let Some(store) = &self.store {
                    let agents_dir = store
                        .agents_dir(session.session_id())
                        .map_err(|e| weave_ai::AiError::Agent(format!("agents dir: {e}")))?;
                    let suffix = instance.map(|i| format!("_w{i}")).unwrap_or_default();
                    let conversation =
                        ConversationLog::open(agents_dir.join(format!("{agent_id}{suffix}")))?;
                    builder = builder.with_conversation(conversation);
                }
            }

            Ok(builder.build())
        };

        self.cache
            .get_or_build(&key, build)
            .await
            .map_err(EngineError::from)
    }

    /// Full invocation pipeline for one unit of work: budget and
    /// cancellation guards, cached agent, retry wrapper, token
    /// accounting, budget-warning emission.
    pub async fn invoke(
        &self,
        session: &SessionState,
        agent_id: &str,
        step_tools: Option<&[String]>,
        instance: Option<usize>,
        prompt: &str,
    ) -> Result<InvokeRecord> {
        self.check_cancelled()?;
        self.check_duration()?;
        self.charge_step()?;

        // One permit per in-flight provider call, workflow-wide.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| EngineError::Provider("run semaphore closed".to_string()))?;

        let agent = self
            .agent_instance(session, agent_id, step_tools, instance)
            .await?;

        debug!(agent_id, prompt_len = prompt.len(), "invoking agent");
        let max_tokens = self.budgets().max_tokens;
        let record = invoke_with_retry(
            &agent,
            prompt,
            &self.retry_policy,
            &self.meter,
            max_tokens,
            |attempt, error| {
                self.emit(
                    session,
                    EventKind::RetryAttempt,
                    json!({"agent": agent_id, "attempt": attempt, "error": error.to_string()}),
                );
            },
        )
        .await
        .map_err(EngineError::from)?;

        if let Some(budget) = max_tokens {
            let total = self.meter.total();
            let threshold = (budget as f64 * BUDGET_WARNING_RATIO) as u64;
            if total >= threshold && !self.budget_warned.swap(true, Ordering::SeqCst) {
                self.emit(
                    session,
                    EventKind::BudgetWarning,
                    json!({"cumulative_tokens": total, "max_tokens": budget}),
                );
            }
        }

        Ok(record)
    }

    /// Write the pause checkpoint for a HITL gate that the caller has
    /// already stored in the pattern state, emit `hitl_pause`, and (in
    /// interactive mode) collect the response.
    ///
    /// Returns `Some(response)` when a handler answered (the session is
    /// back in `running`); `None` means the run stays paused.
    pub fn pause_for_hitl(
        &self,
        session: &mut SessionState,
        hitl: &HitlState,
    ) -> Result<Option<String>> {
        session.transition(SessionStatus::Paused)?;
        self.force_save_session(session)?;
        self.emit(
            session,
            EventKind::HitlPause,
            serde_json::to_value(hitl).unwrap_or_default(),
        );

        let Some(handler) = &self.hitl_handler else {
            return Ok(None);
        };

        let response = handler.respond(hitl);
        session.transition(SessionStatus::Running)?;
        self.emit(
            session,
            EventKind::HitlResume,
            json!({"response": response}),
        );
        Ok(Some(response))
    }
}
