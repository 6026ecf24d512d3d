//! Final report of an orchestration run.
//!
//! The LLM ends a run by replying with a JSON object whose `finished` flag is
//! true. Only the keys modelled here survive; anything else the model invents
//! is dropped on decode.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::completion::parse_json_object;
use crate::error::ToolExecutionError;
use crate::lineage::BranchRange;

pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_ITERATION_LIMIT: &str = "iteration_limit";
pub const STATUS_FINISHED_WITH_ERROR: &str = "finished_with_error";

pub const ITERATION_LIMIT_SUMMARY: &str = "Reached iteration limit before clean review sign-off.";
pub const TOOL_ERROR_SUMMARY: &str = "Workflow halted due to a tool execution error.";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    #[serde(default)]
    pub finished: bool,

    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Next steps for the operator.
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub start_branch_id: Option<String>,

    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub latest_branch_id: Option<String>,

    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,

    /// Number or numeric string, as the model emitted it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<Value>,

    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub pr_head_branch: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,

    /// Instruction code of the tool error that halted the run.
    #[serde(default, deserialize_with = "lenient_string", skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

/// Accept strings, numbers and booleans; treat anything else as absent.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

impl FinalReport {
    /// Report for a run halted by a tool error or an aborted loop.
    pub fn error(task: &str, summary: &str, error: Option<&ToolExecutionError>) -> Self {
        let summary = match summary.trim() {
            "" => TOOL_ERROR_SUMMARY.to_string(),
            s => s.to_string(),
        };
        let instruction = error
            .and_then(|e| e.instruction)
            .map(|i| i.as_str().to_string());

        let mut payload = Map::new();
        payload.insert("message".into(), Value::String(summary.clone()));
        if let Some(instruction) = &instruction {
            payload.insert("instruction".into(), Value::String(instruction.clone()));
        }
        if let Some(err) = error.filter(|e| !e.details.is_empty()) {
            payload.insert("details".into(), Value::Object(err.details.clone()));
        }

        Self {
            finished: true,
            status: Some(STATUS_FINISHED_WITH_ERROR.to_string()),
            task: non_blank(task),
            summary: Some(summary),
            instruction,
            error: Some(Value::Object(payload)),
            ..Self::default()
        }
    }

    /// Report for a run that ran out of turns or tool calls.
    pub fn iteration_limit(task: &str) -> Self {
        Self {
            finished: false,
            status: Some(STATUS_ITERATION_LIMIT.to_string()),
            task: non_blank(task),
            summary: Some(ITERATION_LIMIT_SUMMARY.to_string()),
            ..Self::default()
        }
    }

    pub fn status(&self) -> &str {
        self.status.as_deref().unwrap_or_default()
    }

    pub fn is_error(&self) -> bool {
        self.status() == STATUS_FINISHED_WITH_ERROR
    }

    /// Fill `task` and `status` when the model left them out.
    pub fn ensure_defaults(&mut self, task: &str, status: &str) {
        if is_blank(&self.task) {
            self.task = non_blank(task);
        }
        if is_blank(&self.status) {
            self.status = non_blank(status);
        }
    }

    /// Overwrite the branch ids with the lineage actually observed.
    pub fn attach_lineage(&mut self, range: &BranchRange) {
        if range.start_branch_id.is_some() {
            self.start_branch_id = range.start_branch_id.clone();
        }
        if range.latest_branch_id.is_some() {
            self.latest_branch_id = range.latest_branch_id.clone();
        }
    }

    /// Drop blank strings, nulls and a zero PR number.
    pub fn sanitize(&mut self) {
        for field in [
            &mut self.status,
            &mut self.task,
            &mut self.summary,
            &mut self.instructions,
            &mut self.start_branch_id,
            &mut self.latest_branch_id,
            &mut self.pr_url,
            &mut self.pr_head_branch,
            &mut self.instruction,
        ] {
            if is_blank(field) {
                *field = None;
            }
        }
        if self.pr_number.as_ref().is_some_and(is_zero_number) {
            self.pr_number = None;
        }
        if self.error.as_ref().is_some_and(Value::is_null) {
            self.error = None;
        }
    }

    /// Copy optional fields from `other` that are missing here.
    pub fn backfill_from(&mut self, other: &FinalReport) {
        fn fill<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if dst.is_none() {
                dst.clone_from(src);
            }
        }
        fill(&mut self.status, &other.status);
        fill(&mut self.task, &other.task);
        fill(&mut self.start_branch_id, &other.start_branch_id);
        fill(&mut self.latest_branch_id, &other.latest_branch_id);
        fill(&mut self.pr_url, &other.pr_url);
        fill(&mut self.pr_number, &other.pr_number);
        fill(&mut self.pr_head_branch, &other.pr_head_branch);
        fill(&mut self.error, &other.error);
        fill(&mut self.instruction, &other.instruction);
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Parse an assistant reply as a final report.
///
/// Returns `None` unless the reply holds a JSON object with `finished: true`.
pub fn parse_final_report(text: &str) -> Option<FinalReport> {
    let obj = parse_json_object(text).ok()?;
    if obj.get("finished").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    serde_json::from_value(Value::Object(obj)).ok()
}

fn non_blank(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn is_blank(field: &Option<String>) -> bool {
    field.as_deref().map_or(true, |s| s.trim().is_empty())
}

fn is_zero_number(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Number(n) => n.as_f64().map_or(false, |f| f.trunc() == 0.0),
        Value::String(s) => matches!(s.trim(), "" | "0"),
        _ => false,
    }
}
