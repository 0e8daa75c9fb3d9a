//! Checkpoint observer event payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::spec::PatternType;

/// Kinds of events emitted on the optional bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStart,
    StepStart,
    StepComplete,
    TaskStart,
    TaskComplete,
    BranchStart,
    BranchComplete,
    NodeStart,
    NodeComplete,
    HitlPause,
    HitlResume,
    BudgetWarning,
    BudgetExceeded,
    RetryAttempt,
    Error,
    WorkflowComplete,
}

/// A single observer event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub spec_name: String,
    pub pattern_type: PatternType,
    pub kind: EventKind,
    #[serde(default)]
    pub data: Value,
}

impl WorkflowEvent {
    pub fn new(
        session_id: Option<Uuid>,
        spec_name: impl Into<String>,
        pattern_type: PatternType,
        kind: EventKind,
        data: Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id,
            spec_name: spec_name.into(),
            pattern_type,
            kind,
            data,
        }
    }
}
