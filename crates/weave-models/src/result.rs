//! Execution result returned by the driver surface

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EXIT_PAUSE;
use crate::spec::PatternType;

/// Final (or paused) outcome of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_response: Option<String>,
    pub pattern_type: PatternType,
    pub cumulative_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// `"hitl"` when the run paused for a human response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub exit_code: i32,
}

impl ExecutionResult {
    pub fn completed(
        pattern_type: PatternType,
        last_response: Option<String>,
        cumulative_tokens: u64,
        session_id: Option<Uuid>,
    ) -> Self {
        Self {
            success: true,
            last_response,
            pattern_type,
            cumulative_tokens,
            session_id,
            artifacts: Vec::new(),
            agent_id: None,
            exit_code: 0,
        }
    }

    pub fn paused(
        pattern_type: PatternType,
        cumulative_tokens: u64,
        session_id: Uuid,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            last_response: Some(prompt.into()),
            pattern_type,
            cumulative_tokens,
            session_id: Some(session_id),
            artifacts: Vec::new(),
            agent_id: Some("hitl".to_string()),
            exit_code: EXIT_PAUSE,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.exit_code == EXIT_PAUSE
    }
}
