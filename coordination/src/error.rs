//! Tool execution error taxonomy.
//!
//! Every failure a dispatched tool can report to the orchestration loop is a
//! [`ToolExecutionError`]. Whether the loop keeps going is decided by the
//! optional [`Instruction`], never by the message text.
//!
//! | Failure                                   | Instruction      |
//! |-------------------------------------------|------------------|
//! | bad tool arguments, unknown tool          | none             |
//! | status poll transport error               | none (upgraded by `run_agent`) |
//! | launch failure / missing branch id        | `FinishWorkflow` |
//! | branch reported `failed`                  | `FinishWorkflow` |
//! | poll deadline exceeded                    | `FinishWorkflow` |
//! | review artifact retries exhausted         | `FinishWorkflow` |

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Closed set of control codes a tool error can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Instruction {
    /// Stop the workflow immediately; the failure cannot be repaired by the LLM.
    #[serde(rename = "FINISHED_WITH_ERROR")]
    FinishWorkflow,
}

impl Instruction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FinishWorkflow => "FINISHED_WITH_ERROR",
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tool failure as reported back to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ToolExecutionError {
    /// Human-readable diagnostic.
    pub message: String,

    /// Control code; `Some` halts the orchestration loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<Instruction>,

    /// Structured diagnostics (attempt counts, branch ids, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl ToolExecutionError {
    /// An error the LLM may react to on its next turn.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            instruction: None,
            details: Map::new(),
        }
    }

    /// An error that ends the run with an error report.
    pub fn finish_workflow(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            instruction: Some(Instruction::FinishWorkflow),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Attach the finish-workflow instruction unless one is already present.
    pub fn into_fatal(mut self) -> Self {
        if self.instruction.is_none() {
            self.instruction = Some(Instruction::FinishWorkflow);
        }
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.instruction == Some(Instruction::FinishWorkflow)
    }
}

/// Outcome of one tool invocation.
///
/// Serialises to the envelope the LLM sees:
/// `{"status":"success","data":..}` or `{"status":"error","error":{..}}`.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Failure(ToolExecutionError),
}

impl ToolOutcome {
    pub fn status_str(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure(_) => "error",
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Success(data) => Some(data),
            Self::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ToolExecutionError> {
        match self {
            Self::Success(_) => None,
            Self::Failure(err) => Some(err),
        }
    }

    /// The halting instruction, if the tool failed with one.
    pub fn instruction(&self) -> Option<Instruction> {
        self.error().and_then(|err| err.instruction)
    }

    /// Render the JSON envelope.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({
                "status": "error",
                "error": { "message": format!("failed to encode tool result: {e}") },
            })
        })
    }
}

impl From<Result<Value, ToolExecutionError>> for ToolOutcome {
    fn from(result: Result<Value, ToolExecutionError>) -> Self {
        match result {
            Ok(data) => Self::Success(data),
            Err(err) => Self::Failure(err),
        }
    }
}

impl Serialize for ToolOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("status", self.status_str())?;
        match self {
            Self::Success(data) => map.serialize_entry("data", data)?,
            Self::Failure(err) => map.serialize_entry("error", err)?,
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_finish_workflow_serialises_instruction_code() {
        let err = ToolExecutionError::finish_workflow("launch failed")
            .with_detail("branch_id", "b-1")
            .with_detail("attempts", 3);
        let outcome = ToolOutcome::Failure(err);

        assert_eq!(
            outcome.to_json(),
            json!({
                "status": "error",
                "error": {
                    "message": "launch failed",
                    "instruction": "FINISHED_WITH_ERROR",
                    "details": { "branch_id": "b-1", "attempts": 3 },
                },
            })
        );
        assert_eq!(outcome.instruction(), Some(Instruction::FinishWorkflow));
    }

    #[test]
    fn test_recoverable_error_omits_empty_fields() {
        let outcome = ToolOutcome::Failure(ToolExecutionError::recoverable("bad args"));
        assert_eq!(
            outcome.to_json(),
            json!({ "status": "error", "error": { "message": "bad args" } })
        );
        assert_eq!(outcome.instruction(), None);
    }

    #[test]
    fn test_success_envelope_wraps_data() {
        let outcome = ToolOutcome::from(Ok(json!({ "branch_id": "b-9" })));
        assert_eq!(outcome.status_str(), "success");
        assert_eq!(
            outcome.to_json(),
            json!({ "status": "success", "data": { "branch_id": "b-9" } })
        );
    }

    #[test]
    fn test_into_fatal_keeps_existing_instruction() {
        let err = ToolExecutionError::recoverable("poll failed").into_fatal();
        assert!(err.is_fatal());
        let again = err.clone().into_fatal();
        assert_eq!(again, err);
    }

    #[test]
    fn test_error_roundtrips_through_json() {
        let err = ToolExecutionError::finish_workflow("timeout").with_detail("status", "running");
        let value = serde_json::to_value(&err).unwrap();
        let back: ToolExecutionError = serde_json::from_value(value).unwrap();
        assert_eq!(back, err);
    }
}
