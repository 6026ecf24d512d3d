//! Request and result shapes of the dispatch engine.

use serde::{Deserialize, Serialize};

/// Characters of the branch output kept in an `execute_agent` response.
pub const EXECUTE_RESPONSE_MAX_CHARS: usize = 8_000;
/// Default character budget of the `branch_output` tool.
pub const BRANCH_OUTPUT_MAX_CHARS: usize = 20_000;

/// One agent launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent: String,
    pub prompt: String,
    /// Blank means "use the dispatcher's default project".
    #[serde(default)]
    pub project_name: String,
    pub parent_branch_id: String,
}

impl AgentRequest {
    pub fn new(agent: impl Into<String>, prompt: impl Into<String>, parent_branch_id: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            prompt: prompt.into(),
            project_name: String::new(),
            parent_branch_id: parent_branch_id.into(),
        }
    }

    pub fn with_project(mut self, project_name: impl Into<String>) -> Self {
        self.project_name = project_name.into();
        self
    }
}

/// Which end of the text an excerpt keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExcerptMode {
    Head,
    Tail,
}

impl ExcerptMode {
    pub fn from_tail(tail: bool) -> Self {
        if tail {
            Self::Tail
        } else {
            Self::Head
        }
    }
}

/// Arguments of a `branch_output` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRequest {
    pub branch_id: String,
    pub full_output: bool,
    pub tail: bool,
    pub max_chars: usize,
}

impl OutputRequest {
    /// Full tail fetch with the default budget.
    pub fn tail_of(branch_id: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            full_output: true,
            tail: true,
            max_chars: BRANCH_OUTPUT_MAX_CHARS,
        }
    }
}

/// How to pull more of an output that was truncated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputHint {
    pub tool: String,
    pub arguments: OutputRequest,
}

impl OutputHint {
    pub fn branch_output(arguments: OutputRequest) -> Self {
        Self {
            tool: "branch_output".to_string(),
            arguments,
        }
    }
}

/// Successful `execute_agent` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRun {
    pub branch_id: String,
    pub status: String,
    /// Tail excerpt of the branch output.
    pub response: String,
    pub response_truncated: bool,
    pub response_max_chars: usize,
    pub response_excerpt_mode: ExcerptMode,
    pub full_output_hint: OutputHint,
    /// Contents of the review log, for `review_code` runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_report: Option<String>,
}

/// Successful `branch_output` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchOutput {
    pub branch_id: String,
    pub output: String,
    pub output_truncated: bool,
    pub output_max_chars: usize,
    pub output_excerpt_mode: ExcerptMode,
    pub full_output_fetched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_output_hint: Option<OutputHint>,
}

/// Counters kept by the dispatcher; not part of any tool payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub launches: u64,
    pub status_polls: u64,
    pub review_attempts: u64,
}
