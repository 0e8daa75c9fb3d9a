//! Deterministic scripted model client for tests and offline runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{sleep, Duration};

use crate::error::{AiError, Result};
use crate::llm::client::{
    CompletionRequest, CompletionResponse, ModelClient, Role, StopReason,
};

/// Scripted step for deterministic mock completions.
#[derive(Debug, Clone)]
pub enum MockStepKind {
    /// Return a plain assistant message.
    Text(String),
    /// Return an error (retryable or not, per the message text).
    Error(String),
}

/// One scripted step with optional delay and token overrides.
#[derive(Debug, Clone)]
pub struct MockStep {
    pub delay_ms: u64,
    pub kind: MockStepKind,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl MockStep {
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            delay_ms: 0,
            input_tokens: 1,
            output_tokens: content.len() as u64,
            kind: MockStepKind::Text(content),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            delay_ms: 0,
            input_tokens: 0,
            output_tokens: 0,
            kind: MockStepKind::Error(message.into()),
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }
}

/// A deterministic mock client driven by scripted steps.
///
/// When the script runs out it echoes the last user message as
/// `mock-echo: {content}`, so unscripted calls stay observable.
#[derive(Clone, Default)]
pub struct MockClient {
    model: String,
    script: Arc<Mutex<VecDeque<MockStep>>>,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockClient {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_steps(model: impl Into<String>, steps: Vec<MockStep>) -> Self {
        let client = Self::new(model);
        *client.script.lock() = VecDeque::from(steps);
        client
    }

    pub fn push_step(&self, step: MockStep) {
        self.script.lock().push_back(step);
    }

    /// Total completed `complete` calls.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// High-water mark of concurrent in-flight calls.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Option<MockStep> {
        self.script.lock().pop_front()
    }

    fn fallback_response(request: &CompletionRequest) -> CompletionResponse {
        let text = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| format!("mock-echo: {}", m.content))
            .unwrap_or_else(|| "mock-ok".to_string());

        CompletionResponse {
            input_tokens: 1,
            output_tokens: text.len() as u64,
            text,
            tool_calls: Vec::new(),
            stop_reason: StopReason::Stop,
        }
    }
}

#[async_trait]
impl ModelClient for MockClient {
    fn provider(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let result = async {
            let step = self.next_step();
            let Some(step) = step else {
                return Ok(Self::fallback_response(&request));
            };

            if step.delay_ms > 0 {
                sleep(Duration::from_millis(step.delay_ms)).await;
            }

            match step.kind {
                MockStepKind::Text(content) => Ok(CompletionResponse {
                    text: content,
                    tool_calls: Vec::new(),
                    stop_reason: StopReason::Stop,
                    input_tokens: step.input_tokens,
                    output_tokens: step.output_tokens,
                }),
                MockStepKind::Error(message) => Err(AiError::Llm(message)),
            }
        }
        .await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        result
    }
}
