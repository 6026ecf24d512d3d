//! Tool-call handling for the orchestration loop.
//!
//! Decodes an LLM [`ToolCall`] into typed arguments, runs it through the
//! dispatcher and wraps the result in a [`ToolOutcome`] envelope.

pub mod schema;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::completion::{ToolCall, ToolDefinition};
use crate::dispatch::{AgentDispatcher, AgentExecutor};
use crate::error::{ToolExecutionError, ToolOutcome};
use crate::lineage::BranchRange;

pub use schema::{
    tool_catalog, BranchOutputArgs, ExecuteAgentArgs, ReadArtifactArgs, BRANCH_OUTPUT, EXECUTE_AGENT,
    READ_ARTIFACT,
};

/// Executes one tool call at a time on behalf of the turn loop.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run the call. Never fails: errors are folded into the outcome.
    async fn handle(&self, call: &ToolCall) -> ToolOutcome;

    /// Tool catalog offered to the LLM.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Lineage recorded by the calls executed so far.
    fn branch_range(&self) -> BranchRange;
}

/// Production [`ToolExecutor`] backed by an [`AgentDispatcher`].
pub struct ToolHandler {
    dispatcher: Arc<AgentDispatcher>,
}

impl ToolHandler {
    pub fn new(dispatcher: Arc<AgentDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<AgentDispatcher> {
        &self.dispatcher
    }

    async fn dispatch(&self, call: &ToolCall) -> Result<Value, ToolExecutionError> {
        match call.function.name.as_str() {
            schema::EXECUTE_AGENT => {
                let args: ExecuteAgentArgs = decode_args(&call.function.arguments)?;
                let run = self.dispatcher.execute_agent(&args.into_request()).await?;
                to_data(&run)
            }
            schema::READ_ARTIFACT => {
                let args: ReadArtifactArgs = decode_args(&call.function.arguments)?;
                self.dispatcher.read_branch_artifact(&args.branch_id, &args.path).await
            }
            schema::BRANCH_OUTPUT => {
                let args: BranchOutputArgs = decode_args(&call.function.arguments)?;
                let output = self.dispatcher.branch_output(&args.into_request()).await?;
                to_data(&output)
            }
            other => Err(ToolExecutionError::recoverable(format!("Unsupported tool: {other}"))),
        }
    }
}

#[async_trait]
impl ToolExecutor for ToolHandler {
    async fn handle(&self, call: &ToolCall) -> ToolOutcome {
        let outcome = ToolOutcome::from(self.dispatch(call).await);
        if let ToolOutcome::Failure(err) = &outcome {
            warn!(
                tool = %call.function.name,
                call_id = %call.id,
                fatal = err.is_fatal(),
                error = %err,
                "Tool call failed"
            );
        }
        outcome
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        tool_catalog()
    }

    fn branch_range(&self) -> BranchRange {
        AgentExecutor::branch_range(self.dispatcher.as_ref())
    }
}

/// Decode tool arguments. Blank argument strings decode as `{}`.
pub fn decode_args<T: DeserializeOwned>(raw: &str) -> Result<T, ToolExecutionError> {
    let raw = if raw.trim().is_empty() { "{}" } else { raw };
    serde_json::from_str(raw)
        .map_err(|e| ToolExecutionError::recoverable(format!("Invalid JSON arguments: {e}")))
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, ToolExecutionError> {
    serde_json::to_value(value)
        .map_err(|e| ToolExecutionError::recoverable(format!("failed to encode tool result: {e}")))
}
