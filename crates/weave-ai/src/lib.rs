//! Model clients, the shared client pool, live agents with a build-once
//! cache, tool adapters, and the retry & budget invocation wrapper.

pub mod agent;
pub mod error;
pub mod hooks;
pub mod http_client;
pub mod invoke;
pub mod llm;
pub mod tools;

pub use agent::{Agent, AgentBuilder, AgentCache, AgentKey, AttemptResponse, ConversationLog};
pub use error::{AiError, Result};
pub use http_client::build_http_client;
pub use hooks::{HookDescriptor, HITL_APPROVAL_HOOK};
pub use invoke::{invoke_with_retry, InvokeRecord, RetryPolicy, TokenMeter};
pub use llm::{
    AnthropicClient, CompletionRequest, CompletionResponse, Message, MockClient, MockStep,
    MockStepKind, ModelClient, ModelPool, OpenAiClient, Role, StopReason, ToolCall,
};
pub use tools::{
    jit_instructions, GrepTool, HeadTool, HttpTool, McpTool, SearchTool, TailTool, Tool,
    ToolHandle, ToolOutput, ToolResolver, ToolSchema, JIT_TOOL_NAMES,
};
