//! JIT retrieval tools: bounded, read-only file access for agents.
//!
//! Injected when the context policy names them. All four tools accept
//! absolute paths only and refuse symlinks and binary files; none of
//! them can write.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::tools::traits::{Tool, ToolOutput, ToolSchema};

/// Names of the JIT retrieval tools, in injection order.
pub const JIT_TOOL_NAMES: [&str; 4] = ["grep", "head", "tail", "search"];

const DEFAULT_LINES: usize = 20;
const MAX_MATCHES: usize = 200;
const MAX_SEARCH_FILES: usize = 2_000;
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

fn check_readable_file(raw: &str) -> std::result::Result<PathBuf, String> {
    let path = PathBuf::from(raw);
    if !path.is_absolute() {
        return Err(format!("path must be absolute: {raw}"));
    }
    let meta = std::fs::symlink_metadata(&path).map_err(|e| format!("cannot stat {raw}: {e}"))?;
    if meta.file_type().is_symlink() {
        return Err(format!("symlinks are not allowed: {raw}"));
    }
    if !meta.is_file() {
        return Err(format!("not a regular file: {raw}"));
    }
    Ok(path)
}

fn check_readable_dir(raw: &str) -> std::result::Result<PathBuf, String> {
    let path = PathBuf::from(raw);
    if !path.is_absolute() {
        return Err(format!("path must be absolute: {raw}"));
    }
    let meta = std::fs::symlink_metadata(&path).map_err(|e| format!("cannot stat {raw}: {e}"))?;
    if meta.file_type().is_symlink() {
        return Err(format!("symlinks are not allowed: {raw}"));
    }
    if !meta.is_dir() {
        return Err(format!("not a directory: {raw}"));
    }
    Ok(path)
}

fn read_text_file(path: &Path) -> std::result::Result<String, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    if sniff.contains(&0) {
        return Err(format!("binary files are not allowed: {}", path.display()));
    }
    String::from_utf8(bytes).map_err(|_| format!("binary files are not allowed: {}", path.display()))
}

#[derive(Deserialize)]
struct GrepInput {
    path: String,
    pattern: String,
}

/// Regex match over one file, returning numbered lines.
pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            self.name(),
            "Search one file for lines matching a regular expression. Read-only; absolute paths only.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Absolute file path"},
                    "pattern": {"type": "string", "description": "Regular expression"}
                },
                "required": ["path", "pattern"]
            }),
        )
    }

    async fn execute(&self, input: Value) -> Result<ToolOutput> {
        let params: GrepInput = serde_json::from_value(input)?;
        let path = match check_readable_file(&params.path) {
            Ok(path) => path,
            Err(message) => return Ok(ToolOutput::failure(message)),
        };
        let regex = match Regex::new(&params.pattern) {
            Ok(regex) => regex,
            Err(e) => return Ok(ToolOutput::failure(format!("invalid pattern: {e}"))),
        };
        let text = match read_text_file(&path) {
            Ok(text) => text,
            Err(message) => return Ok(ToolOutput::failure(message)),
        };

        let matches: Vec<String> = text
            .lines()
            .enumerate()
            .filter(|(_, line)| regex.is_match(line))
            .take(MAX_MATCHES)
            .map(|(idx, line)| format!("{}:{}", idx + 1, line))
            .collect();

        Ok(ToolOutput::success(json!({
            "path": params.path,
            "matches": matches,
        })))
    }
}

#[derive(Deserialize)]
struct HeadTailInput {
    path: String,
    lines: Option<usize>,
}

/// First N lines of a file.
pub struct HeadTool;

#[async_trait]
impl Tool for HeadTool {
    fn name(&self) -> &str {
        "head"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            self.name(),
            "Read the first N lines of a file. Read-only; absolute paths only.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Absolute file path"},
                    "lines": {"type": "integer", "description": "Line count (default 20)"}
                },
                "required": ["path"]
            }),
        )
    }

    async fn execute(&self, input: Value) -> Result<ToolOutput> {
        let params: HeadTailInput = serde_json::from_value(input)?;
        let path = match check_readable_file(&params.path) {
            Ok(path) => path,
            Err(message) => return Ok(ToolOutput::failure(message)),
        };
        let text = match read_text_file(&path) {
            Ok(text) => text,
            Err(message) => return Ok(ToolOutput::failure(message)),
        };
        let count = params.lines.unwrap_or(DEFAULT_LINES);
        let content: Vec<&str> = text.lines().take(count).collect();
        Ok(ToolOutput::success(json!({
            "path": params.path,
            "content": content.join("\n"),
        })))
    }
}

/// Last N lines of a file.
pub struct TailTool;

#[async_trait]
impl Tool for TailTool {
    fn name(&self) -> &str {
        "tail"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            self.name(),
            "Read the last N lines of a file. Read-only; absolute paths only.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Absolute file path"},
                    "lines": {"type": "integer", "description": "Line count (default 20)"}
                },
                "required": ["path"]
            }),
        )
    }

    async fn execute(&self, input: Value) -> Result<ToolOutput> {
        let params: HeadTailInput = serde_json::from_value(input)?;
        let path = match check_readable_file(&params.path) {
            Ok(path) => path,
            Err(message) => return Ok(ToolOutput::failure(message)),
        };
        let text = match read_text_file(&path) {
            Ok(text) => text,
            Err(message) => return Ok(ToolOutput::failure(message)),
        };
        let count = params.lines.unwrap_or(DEFAULT_LINES);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(count);
        Ok(ToolOutput::success(json!({
            "path": params.path,
            "content": lines[start..].join("\n"),
        })))
    }
}

#[derive(Deserialize)]
struct SearchInput {
    root: String,
    pattern: String,
}

/// Recursive content search under a directory.
pub struct SearchTool;

impl SearchTool {
    fn walk(
        dir: &Path,
        regex: &Regex,
        visited: &mut usize,
        hits: &mut Vec<Value>,
    ) -> std::result::Result<(), String> {
        let entries =
            std::fs::read_dir(dir).map_err(|e| format!("cannot read {}: {e}", dir.display()))?;
        for entry in entries.flatten() {
            if *visited >= MAX_SEARCH_FILES || hits.len() >= MAX_MATCHES {
                return Ok(());
            }
            let path = entry.path();
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.file_type().is_symlink() {
                continue;
            }
            if meta.is_dir() {
                Self::walk(&path, regex, visited, hits)?;
            } else if meta.is_file() {
                *visited += 1;
                let Ok(text) = read_text_file(&path) else {
                    continue;
                };
                for (idx, line) in text.lines().enumerate() {
                    if regex.is_match(line) {
                        hits.push(json!({
                            "path": path.display().to_string(),
                            "line": idx + 1,
                            "text": line,
                        }));
                        if hits.len() >= MAX_MATCHES {
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            self.name(),
            "Search files under a directory for a regular expression. Read-only; absolute paths only.",
            json!({
                "type": "object",
                "properties": {
                    "root": {"type": "string", "description": "Absolute directory path"},
                    "pattern": {"type": "string", "description": "Regular expression"}
                },
                "required": ["root", "pattern"]
            }),
        )
    }

    async fn execute(&self, input: Value) -> Result<ToolOutput> {
        let params: SearchInput = serde_json::from_value(input)?;
        let root = match check_readable_dir(&params.root) {
            Ok(root) => root,
            Err(message) => return Ok(ToolOutput::failure(message)),
        };
        let regex = match Regex::new(&params.pattern) {
            Ok(regex) => regex,
            Err(e) => return Ok(ToolOutput::failure(format!("invalid pattern: {e}"))),
        };

        let mut visited = 0usize;
        let mut hits = Vec::new();
        if let Err(message) = Self::walk(&root, &regex, &mut visited, &mut hits) {
            return Ok(ToolOutput::failure(message));
        }
        Ok(ToolOutput::success(json!({
            "root": params.root,
            "hits": hits,
        })))
    }
}

/// Instructions appended to an agent's system prompt when JIT tools are
/// injected.
pub fn jit_instructions(names: &[String]) -> String {
    format!(
        "You can read local files with these retrieval tools: {}. \
         They accept absolute paths only and are read-only.",
        names.join(", ")
    )
}
