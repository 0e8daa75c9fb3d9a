//! Resolution of spec tool references to invokable handles.
//!
//! A reference resolves to one of four handle kinds: a registered native
//! tool, the built-in HTTP tool, a remote MCP tool (`mcp:<url>#<tool>`),
//! or one of the JIT retrieval tools.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{AiError, Result};
use crate::tools::http::HttpTool;
use crate::tools::jit::{GrepTool, HeadTool, SearchTool, TailTool, JIT_TOOL_NAMES};
use crate::tools::mcp::McpTool;
use crate::tools::traits::{Tool, ToolOutput, ToolSchema};

/// A resolved, invokable tool handle.
pub enum ToolHandle {
    Native(Arc<dyn Tool>),
    Http(Arc<HttpTool>),
    Mcp(Arc<McpTool>),
    Jit(Arc<dyn Tool>),
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Native(_) => "Native",
            Self::Http(_) => "Http",
            Self::Mcp(_) => "Mcp",
            Self::Jit(_) => "Jit",
        };
        f.debug_struct("ToolHandle")
            .field("kind", &kind)
            .field("name", &self.name())
            .finish()
    }
}

impl ToolHandle {
    pub fn name(&self) -> &str {
        match self {
            Self::Native(tool) | Self::Jit(tool) => tool.name(),
            Self::Http(tool) => tool.name(),
            Self::Mcp(tool) => tool.name(),
        }
    }

    pub fn schema(&self) -> ToolSchema {
        match self {
            Self::Native(tool) | Self::Jit(tool) => tool.schema(),
            Self::Http(tool) => tool.schema(),
            Self::Mcp(tool) => tool.schema(),
        }
    }

    pub async fn invoke(&self, input: Value) -> Result<ToolOutput> {
        match self {
            Self::Native(tool) | Self::Jit(tool) => tool.execute(input).await,
            Self::Http(tool) => tool.execute(input).await,
            Self::Mcp(tool) => tool.execute(input).await,
        }
    }

    /// Release transport resources, if the handle owns any.
    pub fn close(&self) {
        if let Self::Mcp(tool) = self {
            tool.close();
        }
    }
}

/// Maps tool references from the spec to handles.
pub struct ToolResolver {
    native: HashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolResolver {
    pub fn new() -> Self {
        Self {
            native: HashMap::new(),
        }
    }

    /// Register a native tool under its own name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.native.insert(tool.name().to_string(), tool);
    }

    pub fn has(&self, name: &str) -> bool {
        self.native.contains_key(name)
    }

    /// Resolve one tool reference.
    pub fn resolve(&self, reference: &str) -> Result<ToolHandle> {
        if let Some(tool) = self.native.get(reference) {
            return Ok(ToolHandle::Native(tool.clone()));
        }

        if reference == "http_request" || reference == "http" {
            return Ok(ToolHandle::Http(Arc::new(HttpTool::new())));
        }

        if let Some(rest) = reference.strip_prefix("mcp:") {
            let (url, tool) = rest.split_once('#').ok_or_else(|| {
                AiError::Tool(format!(
                    "MCP reference must look like mcp:<url>#<tool>: {reference}"
                ))
            })?;
            return Ok(ToolHandle::Mcp(Arc::new(McpTool::new(url, tool))));
        }

        if JIT_TOOL_NAMES.contains(&reference) {
            return Ok(ToolHandle::Jit(jit_tool(reference)));
        }

        Err(AiError::ToolNotFound(reference.to_string()))
    }

    /// Resolve a list of references, preserving order.
    pub fn resolve_all(&self, references: &[String]) -> Result<Vec<Arc<ToolHandle>>> {
        references
            .iter()
            .map(|r| self.resolve(r).map(Arc::new))
            .collect()
    }
}

fn jit_tool(name: &str) -> Arc<dyn Tool> {
    match name {
        "grep" => Arc::new(GrepTool),
        "head" => Arc::new(HeadTool),
        "tail" => Arc::new(TailTool),
        _ => Arc::new(SearchTool),
    }
}
