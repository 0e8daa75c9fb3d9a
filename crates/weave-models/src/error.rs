//! Engine error kinds and their process exit-code mapping

use thiserror::Error;

/// Exit code returned when a run pauses for a human response.
///
/// Distinct from every failure code so drivers can branch on it
/// (75 = EX_TEMPFAIL, "try again later").
pub const EXIT_PAUSE: i32 = 75;

/// Stable error kinds surfaced by executors and the resume dispatcher.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Non-retryable provider failure, or a transient one after retries
    /// were exhausted.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("template error: {0}")]
    Template(String),

    /// Structural problem in the spec: DAG cycle, unknown dependency,
    /// invalid edge target, undefined agent.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("HITL deadline exceeded: {0}")]
    HitlTimeout(String),

    /// Resume was called on a paused session without a response.
    #[error("session is waiting for a HITL response: {0}")]
    WaitingForHitl(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already completed: {0}")]
    AlreadyCompleted(String),

    /// Graph node iterations or orchestrator rounds hit their cap.
    #[error("iteration limit reached: {0}")]
    IterationLimit(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Map the error kind to the driver's process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound(_) | Self::AlreadyCompleted(_) => 2,
            Self::Io(_) => 12,
            Self::Unsupported(_) => 18,
            Self::BudgetExceeded(_) => 19,
            Self::Provider(_)
            | Self::Template(_)
            | Self::Validation(_)
            | Self::Tool(_)
            | Self::HitlTimeout(_)
            | Self::WaitingForHitl(_)
            | Self::IterationLimit(_)
            | Self::Cancelled => 10,
        }
    }

    /// Short stable tag recorded in `metadata.error` as `kind:detail`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provider(_) => "provider",
            Self::Template(_) => "template",
            Self::Validation(_) => "validation",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::Tool(_) => "tool",
            Self::Io(_) => "io",
            Self::HitlTimeout(_) => "hitl_timeout",
            Self::WaitingForHitl(_) => "waiting_for_hitl",
            Self::NotFound(_) => "not_found",
            Self::AlreadyCompleted(_) => "already_completed",
            Self::IterationLimit(_) => "iteration_limit",
            Self::Unsupported(_) => "unsupported",
            Self::Cancelled => "cancelled",
        }
    }

    /// Render as the `kind:detail` form stored in session metadata.
    pub fn detail_string(&self) -> String {
        format!("{}:{}", self.kind(), self)
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
