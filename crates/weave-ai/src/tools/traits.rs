//! Tool contract: schema advertisement and invocation outcomes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// JSON Schema advertised to the model for one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSchema {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Outcome of one tool invocation.
///
/// Failures stay inside the conversation: the message is rendered back
/// to the model as the tool result, so a later turn can recover or try
/// a different approach. `retryable` marks transient failures (timeouts,
/// throttling) that a caller may reasonably attempt again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToolOutput {
    Success { result: Value },
    Failure { message: String, retryable: bool },
}

impl ToolOutput {
    pub fn success(result: Value) -> Self {
        Self::Success { result }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable_failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Success { result } => Some(result),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { message, .. } => Some(message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Failure {
                retryable: true,
                ..
            }
        )
    }

    /// Render the outcome as tool-result message content. Plain strings
    /// pass through unquoted; structured results serialize as JSON.
    pub fn as_content(&self) -> String {
        match self {
            Self::Success { result } => match result {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            Self::Failure { message, .. } => format!("error: {message}"),
        }
    }
}

/// Core trait for agent tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (used in model function calls)
    fn name(&self) -> &str;

    /// Complete schema advertised to the model
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with given input
    async fn execute(&self, input: Value) -> Result<ToolOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_rendering_unwraps_strings_and_keeps_json() {
        assert_eq!(
            ToolOutput::success(json!("plain text")).as_content(),
            "plain text"
        );
        assert_eq!(
            ToolOutput::success(json!({"k": 1})).as_content(),
            r#"{"k":1}"#
        );
        assert_eq!(
            ToolOutput::failure("boom").as_content(),
            "error: boom"
        );
    }

    #[test]
    fn retryability_is_carried_on_failures_only() {
        assert!(ToolOutput::retryable_failure("throttled").is_retryable());
        assert!(!ToolOutput::failure("bad input").is_retryable());
        assert!(!ToolOutput::success(json!(1)).is_retryable());
    }

    #[test]
    fn accessors_split_the_variants() {
        let ok = ToolOutput::success(json!({"n": 2}));
        assert!(ok.is_success());
        assert_eq!(ok.result().unwrap()["n"], 2);
        assert!(ok.error().is_none());

        let failed = ToolOutput::failure("nope");
        assert!(!failed.is_success());
        assert!(failed.result().is_none());
        assert_eq!(failed.error(), Some("nope"));
    }
}
