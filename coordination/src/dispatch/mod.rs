//! Agent dispatch engine.
//!
//! Converts one asynchronous remote agent run into a synchronous call:
//!
//! ```text
//! AgentRequest
//!     │
//!     ▼
//! launch ──► branch id ──► poll status (geometric backoff, deadline)
//!                                 │
//!                 ┌───────────────┼────────────────┐
//!                 ▼               ▼                ▼
//!             succeeded         failed          timed out
//!                 │               │                │
//!          record lineage   FinishWorkflow   FinishWorkflow
//!                 │
//!                 ▼
//!        fetch output (full → truncated → status payload)
//!                 │
//!                 ▼
//!         AgentRun { tail excerpt, full_output_hint }
//! ```
//!
//! `review_code` runs additionally require `code_review.log` in the workspace
//! directory and are relaunched up to three times when it is missing.

pub mod dispatcher;
pub mod poll;
pub mod types;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolExecutionError;
use crate::lineage::BranchRange;

pub use dispatcher::{AgentDispatcher, REVIEW_ARTIFACT_NAME, REVIEW_CODE_AGENT, REVIEW_MAX_ATTEMPTS};
pub use poll::{Backoff, BranchPhase, BranchStatus, PollConfig};
pub use types::{
    AgentRequest, AgentRun, BranchOutput, DispatchStats, ExcerptMode, OutputHint, OutputRequest,
    BRANCH_OUTPUT_MAX_CHARS, EXECUTE_RESPONSE_MAX_CHARS,
};

/// The part of the dispatcher the verification engine depends on.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run an agent to a terminal state. Routes `review_code` through the
    /// review-log retry loop.
    async fn execute_agent(&self, request: &AgentRequest) -> Result<AgentRun, ToolExecutionError>;

    /// Read a file from a branch filesystem.
    async fn read_artifact(&self, branch_id: &str, path: &str) -> Result<Value, ToolExecutionError>;

    /// Start/latest branches recorded so far.
    fn branch_range(&self) -> BranchRange;
}
