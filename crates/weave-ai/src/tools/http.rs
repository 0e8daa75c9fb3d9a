//! Outbound HTTP request tool.
//!
//! Requests go through the shared proxy-aware client. Transport
//! timeouts, connect errors, throttling and 5xx statuses surface as
//! retryable tool failures; everything else the model sees as a
//! terminal failure it can route around.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::http_client::build_http_client;
use crate::tools::traits::{Tool, ToolOutput, ToolSchema};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Response bodies larger than this are truncated before they reach
/// model context.
const MAX_CAPTURED_BODY: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
struct HttpToolInput {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: Option<HashMap<String, String>>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Generic outbound HTTP request tool.
pub struct HttpTool {
    client: Client,
}

impl Default for HttpTool {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTool {
    pub fn new() -> Self {
        Self {
            client: build_http_client(),
        }
    }

    /// Create with a custom reqwest client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn truncate_body(body: String) -> (String, bool) {
    if body.len() <= MAX_CAPTURED_BODY {
        return (body, false);
    }
    let cut = body
        .char_indices()
        .take_while(|(idx, _)| *idx < MAX_CAPTURED_BODY)
        .last()
        .map(|(idx, c)| idx + c.len_utf8())
        .unwrap_or(0);
    (body[..cut].to_string(), true)
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            self.name(),
            "Call an external HTTP API and return the status plus parsed response body.",
            json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "Absolute request URL"
                    },
                    "method": {
                        "type": "string",
                        "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"],
                        "description": "HTTP method; GET when omitted"
                    },
                    "headers": {
                        "type": "object",
                        "description": "Request headers as string pairs"
                    },
                    "body": {
                        "description": "JSON request body for POST/PUT/PATCH"
                    },
                    "timeout_ms": {
                        "type": "integer",
                        "description": "Per-request timeout in milliseconds"
                    }
                },
                "required": ["url"]
            }),
        )
    }

    async fn execute(&self, input: Value) -> Result<ToolOutput> {
        let params: HttpToolInput = serde_json::from_value(input)?;

        let method_name = params.method.as_deref().unwrap_or("GET").to_uppercase();
        let method = match method_name.as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "PATCH" => Method::PATCH,
            "DELETE" => Method::DELETE,
            other => {
                return Ok(ToolOutput::failure(format!(
                    "unsupported HTTP method '{other}'"
                )));
            }
        };

        let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        let mut request = self.client.request(method, &params.url).timeout(timeout);
        if let Some(headers) = &params.headers {
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }
        if let Some(body) = &params.body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) if error.is_timeout() || error.is_connect() => {
                return Ok(ToolOutput::retryable_failure(format!(
                    "request to {} failed: {error}",
                    params.url
                )));
            }
            Err(error) => {
                return Ok(ToolOutput::failure(format!(
                    "request to {} failed: {error}",
                    params.url
                )));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(error) => {
                return Ok(ToolOutput::failure(format!(
                    "failed to read response body: {error}"
                )));
            }
        };
        let (body, truncated) = truncate_body(body);
        let parsed = serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));

        if status.is_success() {
            return Ok(ToolOutput::success(json!({
                "status": status.as_u16(),
                "body": parsed,
                "truncated": truncated,
            })));
        }

        let message = format!("HTTP {} from {}: {parsed}", status.as_u16(), params.url);
        if status.is_server_error() || status.as_u16() == 429 {
            Ok(ToolOutput::retryable_failure(message))
        } else {
            Ok(ToolOutput::failure(message))
        }
    }
}
