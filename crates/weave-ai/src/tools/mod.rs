//! Tool adapter: trait, built-in tools, and reference resolution

pub mod http;
pub mod jit;
pub mod mcp;
pub mod resolver;
pub mod traits;

pub use http::HttpTool;
pub use jit::{jit_instructions, GrepTool, HeadTool, SearchTool, TailTool, JIT_TOOL_NAMES};
pub use mcp::McpTool;
pub use resolver::{ToolHandle, ToolResolver};
pub use traits::{Tool, ToolOutput, ToolSchema};
