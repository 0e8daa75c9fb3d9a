//! Minimal MCP tool client over streamable HTTP (JSON-RPC).
//!
//! Each MCP tool handle owns a reqwest client bound to one server URL
//! and proxies a single named remote tool. The transport is released
//! when the owning agent cache closes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AiError, Result};
use crate::http_client::build_http_client;
use crate::tools::traits::{Tool, ToolOutput, ToolSchema};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// A remote MCP tool exposed through a server URL.
pub struct McpTool {
    client: Client,
    server_url: String,
    tool_name: String,
    description: String,
    input_schema: Value,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl McpTool {
    pub fn new(server_url: impl Into<String>, tool_name: impl Into<String>) -> Self {
        let tool_name = tool_name.into();
        Self {
            client: build_http_client(),
            server_url: server_url.into(),
            description: format!("Remote MCP tool '{tool_name}'"),
            input_schema: json!({"type": "object"}),
            tool_name,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Release the transport. Further calls fail with a tool error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AiError::Tool(format!(
                "MCP transport for '{}' is closed",
                self.tool_name
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.server_url)
            .header("mcp-protocol-version", MCP_PROTOCOL_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AiError::Tool(format!(
                "MCP server returned HTTP {status} for {method}"
            )));
        }

        let envelope: RpcEnvelope = response.json().await?;
        if let Some(error) = envelope.error {
            return Err(AiError::Tool(format!(
                "MCP error {} calling {method}: {}",
                error.code, error.message
            )));
        }
        envelope
            .result
            .ok_or_else(|| AiError::Tool(format!("MCP response for {method} had no result")))
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            self.name(),
            self.description.clone(),
            self.input_schema.clone(),
        )
    }

    async fn execute(&self, input: Value) -> Result<ToolOutput> {
        let result = self
            .rpc(
                "tools/call",
                json!({"name": self.tool_name, "arguments": input}),
            )
            .await;

        match result {
            Ok(result) => {
                // MCP wraps content blocks; flatten plain text when possible.
                let content = result
                    .get("content")
                    .and_then(|c| c.as_array())
                    .map(|blocks| {
                        blocks
                            .iter()
                            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                            .collect::<Vec<_>>()
                            .join("\n")
                    });
                match content {
                    Some(text) if !text.is_empty() => {
                        Ok(ToolOutput::success(Value::String(text)))
                    }
                    _ => Ok(ToolOutput::success(result)),
                }
            }
            Err(e) => Ok(ToolOutput::failure(e.to_string())),
        }
    }
}
