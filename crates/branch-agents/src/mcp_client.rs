//! JSON-RPC control-plane client.
//!
//! Every operation is an MCP `tools/call` POSTed to one endpoint. Responses
//! may come back as plain JSON or as a single SSE `data:` frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use coordination::control_plane::{ControlPlane, ControlPlaneError, LaunchRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::retry::{is_transient_reqwest, is_transient_status, RetryPolicy};

/// `_meta` key carrying the calling agent's tag.
pub const AGENT_META_KEY: &str = "ai.tidb.pantheon-ai/agent";
pub const DEV_AGENT_TAG: &str = "dev_agent";
pub const REVIEW_AGENT_TAG: &str = "review_agent";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

pub struct McpControlPlane {
    client: reqwest::Client,
    endpoint: String,
    agent_tag: String,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl McpControlPlane {
    pub fn new(endpoint: impl Into<String>, agent_tag: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            agent_tag: agent_tag.into(),
            retry: RetryPolicy::default(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Call one remote tool and return its payload.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ControlPlaneError> {
        let mut meta = Map::new();
        meta.insert(AGENT_META_KEY.to_string(), Value::String(self.agent_tag.clone()));
        let params = json!({ "name": tool, "arguments": arguments, "_meta": meta });

        let result = self
            .retry
            .run(tool, |e| matches!(e, ControlPlaneError::Transport(_)), || {
                self.post_once(tool, params.clone())
            })
            .await?;
        tool_payload(&result)
    }

    async fn post_once(&self, tool: &str, params: Value) -> Result<Value, ControlPlaneError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: "tools/call",
            params,
        };
        debug!(tool, id = request.id, "MCP tools/call");

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if is_transient_reqwest(&e) {
                    ControlPlaneError::Transport(format!("{tool}: {e}"))
                } else {
                    ControlPlaneError::Remote(format!("{tool}: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ControlPlaneError::Transport(format!("{tool}: reading body: {e}")))?;

        if !status.is_success() {
            let message = format!("{tool}: HTTP {status}: {}", body.trim());
            return Err(if status == reqwest::StatusCode::NOT_FOUND {
                ControlPlaneError::NotFound(message)
            } else if is_transient_status(status) {
                ControlPlaneError::Transport(message)
            } else {
                ControlPlaneError::Remote(message)
            });
        }

        let envelope: JsonRpcResponse = serde_json::from_str(&decode_body(&body))
            .map_err(|e| ControlPlaneError::Malformed(format!("{tool}: {e}")))?;
        if let Some(err) = envelope.error {
            return Err(classify_remote(format!("{tool}: JSON-RPC error {}: {}", err.code, err.message)));
        }
        envelope
            .result
            .ok_or_else(|| ControlPlaneError::Malformed(format!("{tool}: response has neither result nor error")))
    }
}

#[async_trait]
impl ControlPlane for McpControlPlane {
    async fn launch(&self, request: &LaunchRequest) -> Result<Value, ControlPlaneError> {
        self.call_tool(
            "parallel_explore",
            json!({
                "project_name": request.project_name,
                "parent_branch_id": request.parent_branch_id,
                "shared_prompt_sequence": [request.prompt],
                "num_branches": 1,
                "agent": request.agent,
            }),
        )
        .await
    }

    async fn get_status(&self, branch_id: &str) -> Result<Value, ControlPlaneError> {
        self.call_tool("get_branch", json!({ "branch_id": branch_id })).await
    }

    async fn read_artifact(&self, branch_id: &str, path: &str) -> Result<Value, ControlPlaneError> {
        self.call_tool("branch_read_file", json!({ "branch_id": branch_id, "file_path": path }))
            .await
    }

    async fn fetch_output(&self, branch_id: &str, full_output: bool) -> Result<String, ControlPlaneError> {
        let payload = self
            .call_tool("branch_output", json!({ "branch_id": branch_id, "full_output": full_output }))
            .await?;
        Ok(match payload {
            Value::String(s) => s,
            other => other.get("output").and_then(Value::as_str).unwrap_or_default().to_string(),
        })
    }
}

/// Strip SSE framing: the last `data:` line wins.
fn decode_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty())
        .last()
        .unwrap_or(trimmed)
        .to_string()
}

/// Unwrap an MCP tool result into the tool's own JSON payload.
fn tool_payload(result: &Value) -> Result<Value, ControlPlaneError> {
    let first_text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| items.iter().find_map(|item| item.get("text").and_then(Value::as_str)));

    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        let message = first_text.map(str::to_string).unwrap_or_else(|| result.to_string());
        return Err(classify_remote(message));
    }
    if let Some(structured) = result.get("structuredContent").filter(|v| !v.is_null()) {
        return Ok(structured.clone());
    }
    if let Some(text) = first_text {
        return Ok(serde_json::from_str::<Value>(text).unwrap_or_else(|_| json!({ "output": text })));
    }
    Ok(result.clone())
}

fn classify_remote(message: String) -> ControlPlaneError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("404") || lower.contains("not found") {
        ControlPlaneError::NotFound(message)
    } else {
        ControlPlaneError::Remote(message)
    }
}
