//! Argument contracts of the three orchestration tools.
//!
//! ```text
//! execute_agent  run an agent role on a new branch and wait for it
//! read_artifact  read a file from a branch filesystem
//! branch_output  pull more of a branch's output on demand
//! ```
//!
//! Required string fields default to empty so that a missing field reaches the
//! handler's own validation instead of failing JSON decoding.

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::completion::ToolDefinition;
use crate::dispatch::{AgentRequest, OutputRequest, BRANCH_OUTPUT_MAX_CHARS};

pub const EXECUTE_AGENT: &str = "execute_agent";
pub const READ_ARTIFACT: &str = "read_artifact";
pub const BRANCH_OUTPUT: &str = "branch_output";

/// Arguments of `execute_agent`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteAgentArgs {
    #[serde(default)]
    #[schemars(description = "Agent role to run, e.g. codex or review_code")]
    pub agent: String,

    #[serde(default)]
    #[schemars(description = "Complete instructions for the agent")]
    pub prompt: String,

    #[schemars(description = "Project name (defaults to the configured project)")]
    pub project_name: Option<String>,

    #[serde(default)]
    #[schemars(description = "Branch to start from")]
    pub parent_branch_id: String,
}

impl ExecuteAgentArgs {
    pub fn into_request(self) -> AgentRequest {
        AgentRequest {
            agent: self.agent,
            prompt: self.prompt,
            project_name: self.project_name.unwrap_or_default(),
            parent_branch_id: self.parent_branch_id,
        }
    }
}

/// Arguments of `read_artifact`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadArtifactArgs {
    #[serde(default)]
    #[schemars(description = "Branch whose filesystem to read")]
    pub branch_id: String,

    #[serde(default)]
    #[schemars(description = "Absolute path of the file")]
    pub path: String,
}

/// Arguments of `branch_output`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct BranchOutputArgs {
    #[serde(default)]
    #[schemars(description = "Branch whose output to fetch")]
    pub branch_id: String,

    #[serde(default)]
    #[schemars(description = "Fetch the complete log instead of the server default excerpt")]
    pub full_output: bool,

    #[serde(default)]
    #[schemars(description = "Keep the end of the output instead of the beginning")]
    pub tail: bool,

    #[schemars(description = "Character budget of the returned excerpt (default: 20000)")]
    pub max_chars: Option<i64>,
}

impl BranchOutputArgs {
    pub fn into_request(self) -> OutputRequest {
        let max_chars = match self.max_chars {
            Some(n) if n > 0 => usize::try_from(n).unwrap_or(BRANCH_OUTPUT_MAX_CHARS),
            _ => BRANCH_OUTPUT_MAX_CHARS,
        };
        OutputRequest {
            branch_id: self.branch_id,
            full_output: self.full_output,
            tail: self.tail,
            max_chars,
        }
    }
}

/// JSON schema of `T` without the root-level metadata the LLM API rejects.
fn parameters_of<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// The tool catalog sent to the LLM on every turn.
pub fn tool_catalog() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: EXECUTE_AGENT.to_string(),
            description: "Launch an agent role on a new branch forked from parent_branch_id and \
                wait until it finishes. Returns the branch id and a tail excerpt of its output."
                .to_string(),
            parameters: parameters_of::<ExecuteAgentArgs>(),
        },
        ToolDefinition {
            name: READ_ARTIFACT.to_string(),
            description: "Read a file from a branch filesystem.".to_string(),
            parameters: parameters_of::<ReadArtifactArgs>(),
        },
        ToolDefinition {
            name: BRANCH_OUTPUT.to_string(),
            description: "Fetch a branch's output, truncated locally to max_chars. Use tail=true \
                to keep the end of long logs."
                .to_string(),
            parameters: parameters_of::<BranchOutputArgs>(),
        },
    ]
}
