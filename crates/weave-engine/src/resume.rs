//! Session-resume dispatcher.
//!
//! Reconstitutes a persisted session, applies HITL timeout rules, and
//! routes to the pattern executor with the resume flag. The executor
//! itself decides whether a pending HITL gate can proceed.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use weave_models::error::{EngineError, Result};
use weave_models::session::SessionStatus;
use weave_models::spec::WorkflowSpec;
use weave_models::ExecutionResult;

use crate::executor::{finalize, Engine, ExecuteOptions};
use crate::patterns::{run_pattern, ResumeMode};

impl Engine {
    /// Resume a persisted session, optionally answering a pending HITL
    /// gate with `hitl_response`.
    ///
    /// `current_spec` is the spec as it exists on disk now, if the
    /// caller has one; a hash drift against the session warns but never
    /// blocks (the user may have intentionally fixed the spec). The
    /// executor always runs against the session's own snapshot.
    pub async fn resume(
        &self,
        session_id: Uuid,
        mut hitl_response: Option<String>,
        current_spec: Option<&WorkflowSpec>,
        mut options: ExecuteOptions,
    ) -> Result<ExecutionResult> {
        let mut session = self
            .store
            .load(session_id)
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))?;

        match session.metadata.status {
            SessionStatus::Completed => {
                return Err(EngineError::AlreadyCompleted(format!(
                    "session {session_id} already completed"
                )));
            }
            SessionStatus::Failed => {
                return Err(EngineError::AlreadyCompleted(format!(
                    "session {session_id} failed and cannot be resumed"
                )));
            }
            SessionStatus::Running | SessionStatus::Paused => {}
        }

        let (snapshot_text, snapshot_format) = self
            .store
            .load_spec_snapshot(session_id)
            .map_err(EngineError::from)?
            .ok_or_else(|| {
                EngineError::Io(format!("session {session_id} has no spec snapshot"))
            })?;
        let spec = WorkflowSpec::parse(&snapshot_text, snapshot_format)?;

        if let Some(current) = current_spec {
            if current.spec_hash() != session.metadata.spec_hash {
                warn!(
                    %session_id,
                    workflow = %session.metadata.workflow_name,
                    "spec_changed: on-disk spec differs from the session snapshot; proceeding"
                );
            }
        }

        // HITL deadline: an expired gate either falls back to its
        // default response or fails the run.
        if hitl_response.is_none() {
            if let Some(hitl) = session.pattern_state.hitl_state() {
                if let Some(timeout_at) = hitl.timeout_at {
                    if Utc::now() > timeout_at {
                        match hitl.default_response.clone() {
                            Some(default) => {
                                info!(%session_id, "HITL deadline passed, applying default response");
                                hitl_response = Some(default);
                            }
                            None => {
                                let error = EngineError::HitlTimeout(format!(
                                    "session {session_id} HITL deadline passed with no default"
                                ));
                                session.metadata.error = Some(error.detail_string());
                                let _ = session.transition(SessionStatus::Running);
                                let _ = session.transition(SessionStatus::Failed);
                                self.store
                                    .save(&session, &snapshot_text, snapshot_format)
                                    .map_err(EngineError::from)?;
                                return Err(error);
                            }
                        }
                    }
                }
            }
        }

        if session.metadata.status == SessionStatus::Paused {
            session.transition(SessionStatus::Running)?;
        }

        // Resumed runs always persist; there is already a session dir.
        options.persist = true;
        let ctx = self.build_context(Arc::new(spec), options);
        ctx.meter.restore(&session.token_usage);

        info!(
            %session_id,
            workflow = %session.metadata.workflow_name,
            pattern = %session.metadata.pattern_type,
            "resuming workflow"
        );

        let outcome = run_pattern(&ctx, &mut session, ResumeMode::Resume { hitl_response }).await;
        finalize(&ctx, session, outcome)
    }
}
