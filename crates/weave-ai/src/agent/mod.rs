//! Live agents: pooled model client + rendered system prompt + bound
//! tools + hooks + optional conversation handle.

pub mod cache;
pub mod conversation;

pub use cache::{AgentCache, AgentKey};
pub use conversation::ConversationLog;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{AiError, Result};
use crate::hooks::HookDescriptor;
use crate::llm::{CompletionRequest, Message, ModelClient, StopReason};
use crate::tools::ToolHandle;

/// Cap on model->tool->model rounds inside one invocation.
const MAX_TOOL_ROUNDS: usize = 8;

/// One raw completion attempt (no retry, history not yet committed).
#[derive(Debug, Clone)]
pub struct AttemptResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A composed execution unit, shared via the agent cache.
pub struct Agent {
    agent_id: String,
    client: Arc<dyn ModelClient>,
    system_prompt: String,
    tools: Vec<Arc<ToolHandle>>,
    hooks: Vec<HookDescriptor>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_tokens: Option<u32>,
    conversation: Option<Mutex<ConversationLog>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("agent_id", &self.agent_id)
            .field("system_prompt", &self.system_prompt)
            .field("tools", &self.tools.len())
            .field("hooks", &self.hooks)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("max_tokens", &self.max_tokens)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Agent {
    pub fn builder(agent_id: impl Into<String>, client: Arc<dyn ModelClient>) -> AgentBuilder {
        AgentBuilder {
            agent_id: agent_id.into(),
            client,
            system_prompt: String::new(),
            tools: Vec::new(),
            hooks: Vec::new(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            conversation: None,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn hooks(&self) -> &[HookDescriptor] {
        &self.hooks
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// One completion attempt over prior history plus `prompt`, running
    /// the tool loop until the model stops asking for tools. History is
    /// not modified; call [`Agent::commit_turn`] after the attempt that
    /// gets kept.
    pub async fn complete_once(&self, prompt: &str) -> Result<AttemptResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AiError::Agent(format!(
                "agent '{}' has been closed",
                self.agent_id
            )));
        }

        let mut messages = self.history_snapshot().await;
        messages.push(Message::user(prompt));

        let schemas: Vec<_> = self.tools.iter().map(|t| t.schema()).collect();
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;

        for _round in 0..MAX_TOOL_ROUNDS {
            let request = CompletionRequest::new(messages.clone())
                .with_system(self.system_prompt.clone())
                .with_tools(schemas.clone())
                .with_temperature(self.temperature)
                .with_top_p(self.top_p)
                .with_max_tokens(self.max_tokens);

            let response = self.client.complete(request).await?;
            input_tokens += response.input_tokens;
            output_tokens += response.output_tokens;

            if response.stop_reason != StopReason::ToolUse || response.tool_calls.is_empty() {
                return Ok(AttemptResponse {
                    text: response.text,
                    input_tokens,
                    output_tokens,
                });
            }

            messages.push(Message::assistant_with_tool_calls(
                Some(response.text.clone()),
                response.tool_calls.clone(),
            ));
            for call in &response.tool_calls {
                let handle = self
                    .tools
                    .iter()
                    .find(|t| t.name() == call.name)
                    .ok_or_else(|| AiError::ToolNotFound(call.name.clone()))?;
                debug!(agent_id = %self.agent_id, tool = %call.name, "invoking tool");
                let output = handle.invoke(call.arguments.clone()).await?;
                messages.push(Message::tool_result(call.id.clone(), output.as_content()));
            }
        }

        Err(AiError::Agent(format!(
            "agent '{}' exceeded {MAX_TOOL_ROUNDS} tool rounds",
            self.agent_id
        )))
    }

    /// Record a kept turn in the conversation log (no-op without a
    /// session handle).
    pub async fn commit_turn(&self, prompt: &str, response: &str) -> Result<()> {
        if let Some(conversation) = &self.conversation {
            let mut log = conversation.lock().await;
            log.append_turn(Message::user(prompt), Message::assistant(response))?;
        }
        Ok(())
    }

    async fn history_snapshot(&self) -> Vec<Message> {
        match &self.conversation {
            Some(conversation) => conversation.lock().await.messages().to_vec(),
            None => Vec::new(),
        }
    }

    /// Release transport resources of bound tools. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for tool in &self.tools {
            tool.close();
        }
    }
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    agent_id: String,
    client: Arc<dyn ModelClient>,
    system_prompt: String,
    tools: Vec<Arc<ToolHandle>>,
    hooks: Vec<HookDescriptor>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_tokens: Option<u32>,
    conversation: Option<ConversationLog>,
}

impl AgentBuilder {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<Arc<ToolHandle>>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_hooks(mut self, hooks: Vec<HookDescriptor>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_inference(
        mut self,
        temperature: Option<f64>,
        top_p: Option<f64>,
        max_tokens: Option<u32>,
    ) -> Self {
        self.temperature = temperature;
        self.top_p = top_p;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_conversation(mut self, conversation: ConversationLog) -> Self {
        self.conversation = Some(conversation);
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            agent_id: self.agent_id,
            client: self.client,
            system_prompt: self.system_prompt,
            tools: self.tools,
            hooks: self.hooks,
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            conversation: self.conversation.map(Mutex::new),
            closed: AtomicBool::new(false),
        }
    }
}
