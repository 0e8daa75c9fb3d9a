//! Error types for the AI layer

use thiserror::Error;

/// AI layer error types
#[derive(Error, Debug)]
pub enum AiError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("{provider} HTTP {status}: {message}")]
    LlmHttp {
        provider: String,
        status: u16,
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Invalid response format: {0}")]
    InvalidFormat(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AiError {
    /// Whether a retry has any chance of succeeding.
    ///
    /// Throttling, 5xx, timeouts and connection resets are transient;
    /// auth and schema failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LlmHttp { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            Self::Llm(message) => {
                let message = message.to_lowercase();
                message.contains("timeout")
                    || message.contains("timed out")
                    || message.contains("rate limit")
                    || message.contains("throttl")
                    || message.contains("overloaded")
                    || message.contains("connection")
            }
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Provider-suggested wait, when the response carried `retry-after`.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::LlmHttp {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

/// Result type alias for AI operations
pub type Result<T> = std::result::Result<T, AiError>;

impl From<AiError> for weave_models::EngineError {
    fn from(err: AiError) -> Self {
        use weave_models::EngineError;
        match err {
            AiError::BudgetExceeded(detail) => EngineError::BudgetExceeded(detail),
            AiError::Tool(detail) | AiError::ToolNotFound(detail) => EngineError::Tool(detail),
            AiError::Io(e) => EngineError::Io(e.to_string()),
            other => EngineError::Provider(other.to_string()),
        }
    }
}
