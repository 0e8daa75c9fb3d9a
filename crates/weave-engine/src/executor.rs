//! Driver surface: build an execution context, dispatch to the pattern
//! executor, and finalize the session.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::info;

use weave_ai::{AgentCache, ModelPool, ToolResolver};
use weave_models::error::{EngineError, Result};
use weave_models::session::{SessionState, SessionStatus};
use weave_models::spec::WorkflowSpec;
use weave_models::{EventKind, ExecutionResult};
use weave_storage::SessionStore;

use crate::context::{ExecutionContext, HitlHandler};
use crate::events::EventBus;
use crate::patterns::{run_pattern, Outcome, ResumeMode};
use crate::validate;

/// Per-run knobs supplied by the driver.
#[derive(Default)]
pub struct ExecuteOptions {
    /// Persist checkpoints (pause checkpoints are always written).
    pub persist: bool,
    pub event_bus: Option<EventBus>,
    pub hitl_handler: Option<Arc<dyn HitlHandler>>,
    /// Caller-owned agent cache; the engine will not close it.
    pub agent_cache: Option<Arc<AgentCache>>,
    pub cancel: Option<watch::Receiver<bool>>,
}

impl ExecuteOptions {
    pub fn persistent() -> Self {
        Self {
            persist: true,
            ..Default::default()
        }
    }
}

/// The orchestration engine: one session store plus process-wide model
/// pool and tool resolver shared across runs.
pub struct Engine {
    pub(crate) store: SessionStore,
    pub(crate) pool: Arc<ModelPool>,
    pub(crate) resolver: Arc<ToolResolver>,
}

impl Engine {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            pool: Arc::new(ModelPool::new()),
            resolver: Arc::new(ToolResolver::new()),
        }
    }

    pub fn with_pool(mut self, pool: Arc<ModelPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<ToolResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Execute a validated spec from the start.
    pub async fn execute(
        &self,
        spec: WorkflowSpec,
        variables: IndexMap<String, Value>,
        options: ExecuteOptions,
    ) -> Result<ExecutionResult> {
        validate::validate(&spec)?;
        let spec = Arc::new(spec);

        let mut merged = spec.inputs.values.clone();
        for (key, value) in variables {
            merged.insert(key, value);
        }

        let mut session = SessionState::new(
            spec.name.clone(),
            spec.spec_hash(),
            spec.pattern_type,
            spec.runtime.clone(),
            merged,
        );

        let ctx = self.build_context(spec, options);
        info!(
            session_id = %session.session_id(),
            workflow = %ctx.spec.name,
            pattern = %ctx.spec.pattern_type,
            "starting workflow"
        );
        ctx.emit(
            &session,
            EventKind::WorkflowStart,
            json!({"variables": session.variables}),
        );
        ctx.save_session(&session)?;

        let outcome = run_pattern(&ctx, &mut session, ResumeMode::Fresh).await;
        finalize(&ctx, session, outcome)
    }

    pub(crate) fn build_context(
        &self,
        spec: Arc<WorkflowSpec>,
        options: ExecuteOptions,
    ) -> ExecutionContext {
        let (cache, owns_cache) = match options.agent_cache {
            Some(cache) => (cache, false),
            None => (Arc::new(AgentCache::new()), true),
        };
        let cancel = options
            .cancel
            .unwrap_or_else(|| watch::channel(false).1);
        ExecutionContext::new(
            spec,
            Some(self.store.clone()),
            options.persist,
            options.event_bus,
            options.hitl_handler,
            cache,
            owns_cache,
            self.pool.clone(),
            self.resolver.clone(),
            cancel,
        )
    }
}

/// Map the executor outcome onto the session lifecycle and the driver
/// result; the engine-owned agent cache closes on every path.
pub(crate) fn finalize(
    ctx: &ExecutionContext,
    mut session: SessionState,
    outcome: Result<Outcome>,
) -> Result<ExecutionResult> {
    let close_cache = || {
        if ctx.owns_cache {
            ctx.cache.close();
        }
    };

    match outcome {
        Ok(Outcome::Completed { last_response }) => {
            session.token_usage = ctx.meter.snapshot();
            session.transition(SessionStatus::Completed)?;
            ctx.save_session(&session)?;
            ctx.emit(
                &session,
                EventKind::WorkflowComplete,
                json!({"cumulative_tokens": ctx.meter.total()}),
            );
            close_cache();
            let session_id = ctx.persist.then(|| session.session_id());
            Ok(ExecutionResult::completed(
                ctx.spec.pattern_type,
                last_response,
                ctx.meter.total(),
                session_id,
            ))
        }
        Ok(Outcome::Paused { prompt }) => {
            // The pause checkpoint was written before the executor
            // returned; the session stays on disk for resume.
            close_cache();
            Ok(ExecutionResult::paused(
                ctx.spec.pattern_type,
                ctx.meter.total(),
                session.session_id(),
                prompt,
            ))
        }
        Err(error) => {
            // A missing HITL response is a caller mistake, not a run
            // failure; the paused checkpoint stays resumable.
            if matches!(error, EngineError::WaitingForHitl(_)) {
                close_cache();
                return Err(error);
            }
            if matches!(error, EngineError::BudgetExceeded(_)) {
                ctx.emit(
                    &session,
                    EventKind::BudgetExceeded,
                    json!({"detail": error.to_string()}),
                );
            }
            ctx.emit(
                &session,
                EventKind::Error,
                json!({"kind": error.kind(), "detail": error.to_string()}),
            );
            session.token_usage = ctx.meter.snapshot();
            session.metadata.error = Some(match &error {
                EngineError::Cancelled => "cancelled".to_string(),
                other => other.detail_string(),
            });
            // A pause may have left the session paused; route through
            // running so the transition stays legal.
            if session.metadata.status == SessionStatus::Paused {
                let _ = session.transition(SessionStatus::Running);
            }
            let _ = session.transition(SessionStatus::Failed);
            let _ = ctx.force_save_session(&session);
            close_cache();
            Err(error)
        }
    }
}
