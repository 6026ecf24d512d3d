//! Remote job control-plane port.
//!
//! The dispatcher only ever talks to the control plane through
//! [`ControlPlane`]; transport framing and authentication live in the adapter.
//! Launch and status payloads stay as raw JSON because the remote service
//! nests branch ids in several shapes (see [`extract_branch_id`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Control-plane failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlPlaneError {
    /// The branch or artifact does not exist (HTTP 404 equivalent).
    #[error("not found (404): {0}")]
    NotFound(String),

    #[error("control plane transport error: {0}")]
    Transport(String),

    #[error("control plane returned error: {0}")]
    Remote(String),

    #[error("malformed control plane response: {0}")]
    Malformed(String),
}

impl ControlPlaneError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Arguments of a single-branch launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub project_name: String,
    pub parent_branch_id: String,
    pub prompt: String,
    pub agent: String,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Launch one branch running `agent` with `prompt`. Returns the raw
    /// launch payload, which must contain a branch id somewhere.
    async fn launch(&self, request: &LaunchRequest) -> Result<Value, ControlPlaneError>;

    /// Fetch the current status payload of a branch.
    async fn get_status(&self, branch_id: &str) -> Result<Value, ControlPlaneError>;

    /// Read a file from the branch filesystem. The payload carries `content`.
    async fn read_artifact(&self, branch_id: &str, path: &str) -> Result<Value, ControlPlaneError>;

    /// Fetch the accumulated text output. `full_output = false` lets the
    /// server apply its default truncation.
    async fn fetch_output(&self, branch_id: &str, full_output: bool)
        -> Result<String, ControlPlaneError>;
}

/// Find the branch id in a launch or status payload.
///
/// Searches `parallel_explore.branches[*]`, `branches[*]`, `branch`, then the
/// `branch_id` and `id` string fields, recursing into nested objects.
pub fn extract_branch_id(payload: &Value) -> Option<String> {
    let obj = payload.as_object()?;

    if let Some(branches) = obj
        .get("parallel_explore")
        .and_then(|pe| pe.get("branches"))
        .and_then(Value::as_array)
    {
        if let Some(id) = branches.iter().find_map(extract_branch_id) {
            return Some(id);
        }
    }
    if let Some(branches) = obj.get("branches").and_then(Value::as_array) {
        if let Some(id) = branches.iter().find_map(extract_branch_id) {
            return Some(id);
        }
    }
    if let Some(id) = obj.get("branch").and_then(extract_branch_id) {
        return Some(id);
    }
    ["branch_id", "id"].iter().find_map(|key| {
        obj.get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    })
}

/// The `content` field of an artifact payload, when non-blank.
pub fn artifact_content(payload: &Value) -> Option<&str> {
    payload
        .get("content")
        .and_then(Value::as_str)
        .filter(|content| !content.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_from_parallel_explore() {
        let payload = json!({
            "parallel_explore": { "branches": [ { "branch": { "id": "pe-1" } } ] },
            "branch_id": "outer",
        });
        assert_eq!(extract_branch_id(&payload).as_deref(), Some("pe-1"));
    }

    #[test]
    fn test_extract_from_branches_then_fields() {
        assert_eq!(
            extract_branch_id(&json!({ "branches": [ {}, { "branch_id": "b-2" } ] })).as_deref(),
            Some("b-2")
        );
        assert_eq!(
            extract_branch_id(&json!({ "id": "b-3", "status": "running" })).as_deref(),
            Some("b-3")
        );
        assert_eq!(
            extract_branch_id(&json!({ "branch_id": "", "id": "b-4" })).as_deref(),
            Some("b-4")
        );
    }

    #[test]
    fn test_extract_missing() {
        assert_eq!(extract_branch_id(&json!({ "status": "ok" })), None);
        assert_eq!(extract_branch_id(&json!("b-1")), None);
    }

    #[test]
    fn test_artifact_content_skips_blank() {
        assert_eq!(artifact_content(&json!({ "content": "log" })), Some("log"));
        assert_eq!(artifact_content(&json!({ "content": "  " })), None);
        assert_eq!(artifact_content(&json!({})), None);
    }

    #[test]
    fn test_not_found_classification() {
        assert!(ControlPlaneError::NotFound("x".into()).is_not_found());
        assert!(!ControlPlaneError::Remote("404".into()).is_not_found());
    }
}
