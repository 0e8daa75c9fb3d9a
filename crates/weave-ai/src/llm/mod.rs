//! Provider clients and the shared model pool

pub mod anthropic;
pub mod client;
pub mod mock;
pub mod openai;
pub mod pool;

pub use anthropic::AnthropicClient;
pub use client::{
    CompletionRequest, CompletionResponse, Message, ModelClient, Role, StopReason, ToolCall,
};
pub use mock::{MockClient, MockStep, MockStepKind};
pub use openai::OpenAiClient;
pub use pool::{ClientFactory, ModelPool};

use crate::error::AiError;

/// Convert a non-success HTTP response into a classified error,
/// truncating large bodies.
pub async fn response_to_error(response: reqwest::Response, provider: &str) -> AiError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();

    // Truncate error bodies so large or sensitive responses never leak.
    const MAX_ERROR_BODY: usize = 512;
    let message = if body.len() > MAX_ERROR_BODY {
        let truncate_at = body
            .char_indices()
            .take_while(|(idx, _)| *idx < MAX_ERROR_BODY)
            .last()
            .map(|(idx, c)| idx + c.len_utf8())
            .unwrap_or(0);
        format!("{}... [truncated]", &body[..truncate_at])
    } else {
        body
    };

    AiError::LlmHttp {
        provider: provider.to_string(),
        status,
        message,
        retry_after_secs: retry_after,
    }
}
