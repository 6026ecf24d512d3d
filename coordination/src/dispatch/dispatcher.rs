//! Launch → poll → fetch for one agent branch.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::poll::{Backoff, BranchPhase, BranchStatus, PollConfig};
use super::types::{
    AgentRequest, AgentRun, BranchOutput, DispatchStats, ExcerptMode, OutputHint, OutputRequest,
    BRANCH_OUTPUT_MAX_CHARS, EXECUTE_RESPONSE_MAX_CHARS,
};
use super::AgentExecutor;
use crate::control_plane::{
    artifact_content, extract_branch_id, ControlPlane, ControlPlaneError, LaunchRequest,
};
use crate::error::ToolExecutionError;
use crate::lineage::{BranchLineage, BranchRange};
use crate::truncate::{preview, truncate_text};

/// Agent whose runs must leave a review log behind.
pub const REVIEW_CODE_AGENT: &str = "review_code";
/// File name of the review log inside the workspace directory.
pub const REVIEW_ARTIFACT_NAME: &str = "code_review.log";
/// Launch attempts before giving up on a missing review log.
pub const REVIEW_MAX_ATTEMPTS: u32 = 3;
/// Characters of output quoted in a failed-branch error.
const FAILURE_EXCERPT_CHARS: usize = 400;
/// Characters of status text quoted in poll log lines.
const STATUS_TEXT_LOG_CHARS: usize = 240;

#[derive(Debug, Default)]
struct Counters {
    launches: AtomicU64,
    status_polls: AtomicU64,
    review_attempts: AtomicU64,
}

/// Turns "launch + wait for terminal state + fetch output" into one call.
///
/// Shared behind an `Arc` by the tool handler and the verification engine;
/// the lineage is the only mutable state and is never locked across an await.
pub struct AgentDispatcher {
    client: Arc<dyn ControlPlane>,
    poll: PollConfig,
    default_project: String,
    workspace_dir: Option<String>,
    lineage: Mutex<BranchLineage>,
    counters: Counters,
}

impl AgentDispatcher {
    pub fn new(client: Arc<dyn ControlPlane>, poll: PollConfig) -> Self {
        Self {
            client,
            poll,
            default_project: String::new(),
            workspace_dir: None,
            lineage: Mutex::new(BranchLineage::new()),
            counters: Counters::default(),
        }
    }

    pub fn with_default_project(mut self, project: impl Into<String>) -> Self {
        self.default_project = project.into().trim().to_string();
        self
    }

    pub fn with_workspace_dir(mut self, dir: impl Into<String>) -> Self {
        let dir = dir.into().trim().to_string();
        self.workspace_dir = (!dir.is_empty()).then_some(dir);
        self
    }

    pub fn poll_config(&self) -> &PollConfig {
        &self.poll
    }

    pub fn default_project(&self) -> &str {
        &self.default_project
    }

    pub fn workspace_dir(&self) -> Option<&str> {
        self.workspace_dir.as_deref()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            launches: self.counters.launches.load(Ordering::Relaxed),
            status_polls: self.counters.status_polls.load(Ordering::Relaxed),
            review_attempts: self.counters.review_attempts.load(Ordering::Relaxed),
        }
    }

    fn lineage(&self) -> MutexGuard<'_, BranchLineage> {
        // Lineage writes are single assignments; a poisoned lock still holds valid data.
        self.lineage.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Path of a file inside the configured workspace directory.
    pub fn workspace_path(&self, file_name: &str) -> Option<String> {
        self.workspace_dir
            .as_deref()
            .map(|dir| Path::new(dir).join(file_name).to_string_lossy().into_owned())
    }

    fn resolve(&self, request: &AgentRequest) -> Result<AgentRequest, ToolExecutionError> {
        let mut resolved = AgentRequest {
            agent: request.agent.trim().to_string(),
            prompt: request.prompt.clone(),
            project_name: request.project_name.trim().to_string(),
            parent_branch_id: request.parent_branch_id.trim().to_string(),
        };
        if resolved.project_name.is_empty() {
            resolved.project_name = self.default_project.clone();
        }
        if resolved.agent.is_empty()
            || resolved.prompt.trim().is_empty()
            || resolved.parent_branch_id.is_empty()
            || resolved.project_name.is_empty()
        {
            return Err(ToolExecutionError::recoverable("missing required arguments"));
        }
        Ok(resolved)
    }

    /// Run one agent to completion and return its output excerpt.
    ///
    /// Launch failures, failed branches and timeouts carry the finish-workflow
    /// instruction. The branch is recorded in the lineage only after a
    /// terminal-success status was observed.
    pub async fn run_agent(&self, request: &AgentRequest) -> Result<AgentRun, ToolExecutionError> {
        let request = self.resolve(request)?;
        info!(
            agent = %request.agent,
            project = %request.project_name,
            parent = %request.parent_branch_id,
            "Executing agent"
        );

        let branch_id = self.launch(&request).await?;
        info!(branch_id = %branch_id, "Waiting for branch to complete");
        let status = self
            .wait_for_terminal(&branch_id)
            .await
            .map_err(ToolExecutionError::into_fatal)?;

        self.lineage().record(&branch_id);

        let text = self.collect_output(&branch_id, &status).await?;
        let (response, truncated) = truncate_text(&text, EXECUTE_RESPONSE_MAX_CHARS, true);
        info!(
            branch_id = %branch_id,
            status = %status.status_label(),
            truncated,
            "Branch completed"
        );
        debug!(branch_id = %branch_id, "Response excerpt (tail):\n{}", response);

        Ok(AgentRun {
            full_output_hint: OutputHint::branch_output(OutputRequest::tail_of(branch_id.clone())),
            branch_id,
            status: status.status.clone(),
            response,
            response_truncated: truncated,
            response_max_chars: EXECUTE_RESPONSE_MAX_CHARS,
            response_excerpt_mode: ExcerptMode::Tail,
            review_report: None,
        })
    }

    /// Run a `review_code` agent until it leaves its review log behind.
    ///
    /// A missing log (not-found) relaunches with the same prompt up to
    /// [`REVIEW_MAX_ATTEMPTS`] times; any other read error ends the workflow.
    pub async fn execute_review_agent(
        &self,
        request: &AgentRequest,
    ) -> Result<AgentRun, ToolExecutionError> {
        let artifact_path = self.workspace_path(REVIEW_ARTIFACT_NAME).ok_or_else(|| {
            ToolExecutionError::recoverable(
                "workspace directory not configured for review_code validation",
            )
        })?;

        let mut last_branch: Option<String> = None;
        for attempt in 1..=REVIEW_MAX_ATTEMPTS {
            self.counters.review_attempts.fetch_add(1, Ordering::Relaxed);
            let mut run = self.run_agent(request).await?;
            last_branch = Some(run.branch_id.clone());

            match self.client.read_artifact(&run.branch_id, &artifact_path).await {
                Ok(artifact) => {
                    run.review_report = artifact_content(&artifact).map(str::to_string);
                    return Ok(run);
                }
                Err(err) if err.is_not_found() => {
                    warn!(
                        attempt,
                        max_attempts = REVIEW_MAX_ATTEMPTS,
                        branch_id = %run.branch_id,
                        path = %artifact_path,
                        "review_code did not produce its review log"
                    );
                }
                Err(err) => {
                    return Err(ToolExecutionError::finish_workflow(format!(
                        "reading {artifact_path} from branch {} failed: {err}",
                        run.branch_id
                    ))
                    .with_detail("attempts", attempt)
                    .with_detail("artifact_path", artifact_path.clone())
                    .with_detail("last_branch_id", run.branch_id.clone()));
                }
            }
        }

        let mut message = format!(
            "review_code failed to produce {artifact_path} after {REVIEW_MAX_ATTEMPTS} attempts"
        );
        if let Some(branch) = last_branch.as_deref() {
            message.push_str(&format!(" (last_branch_id={branch})"));
        }
        message.push('.');

        let mut err = ToolExecutionError::finish_workflow(message)
            .with_detail("attempts", REVIEW_MAX_ATTEMPTS)
            .with_detail("artifact_path", artifact_path);
        if let Some(branch) = last_branch {
            err = err.with_detail("last_branch_id", branch);
        }
        Err(err)
    }

    /// Fetch a branch's output and truncate it locally.
    pub async fn branch_output(
        &self,
        request: &OutputRequest,
    ) -> Result<BranchOutput, ToolExecutionError> {
        let branch_id = request.branch_id.trim();
        if branch_id.is_empty() {
            return Err(ToolExecutionError::recoverable("`branch_id` is required"));
        }
        // Tail excerpts need the whole log; the server default cuts the end.
        let fetch_full = request.full_output || request.tail;
        info!(
            branch_id,
            full_output = fetch_full,
            tail = request.tail,
            max_chars = request.max_chars,
            "Retrieving branch output"
        );

        let text = self
            .client
            .fetch_output(branch_id, fetch_full)
            .await
            .map_err(|e| output_error(branch_id, e))?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ToolExecutionError::recoverable("branch_output returned no textual output"));
        }

        let max_chars = if request.max_chars == 0 {
            BRANCH_OUTPUT_MAX_CHARS
        } else {
            request.max_chars
        };
        let (output, truncated) = truncate_text(text, max_chars, request.tail);
        let full_output_hint = truncated.then(|| {
            OutputHint::branch_output(OutputRequest {
                branch_id: branch_id.to_string(),
                full_output: true,
                tail: request.tail,
                max_chars: max_chars.saturating_mul(2),
            })
        });

        Ok(BranchOutput {
            branch_id: branch_id.to_string(),
            output,
            output_truncated: truncated,
            output_max_chars: max_chars,
            output_excerpt_mode: ExcerptMode::from_tail(request.tail),
            full_output_fetched: fetch_full,
            full_output_hint,
        })
    }

    /// Read a file from a branch.
    pub async fn read_branch_artifact(
        &self,
        branch_id: &str,
        path: &str,
    ) -> Result<Value, ToolExecutionError> {
        let (branch_id, path) = (branch_id.trim(), path.trim());
        if branch_id.is_empty() || path.is_empty() {
            return Err(ToolExecutionError::recoverable("`branch_id` and `path` are required"));
        }
        info!(branch_id, path, "Reading artifact");
        self.client
            .read_artifact(branch_id, path)
            .await
            .map_err(|e| ToolExecutionError::recoverable(format!("branch_read_file failed: {e}")))
    }

    async fn launch(&self, request: &AgentRequest) -> Result<String, ToolExecutionError> {
        self.counters.launches.fetch_add(1, Ordering::Relaxed);
        let launch = LaunchRequest {
            project_name: request.project_name.clone(),
            parent_branch_id: request.parent_branch_id.clone(),
            prompt: request.prompt.clone(),
            agent: request.agent.clone(),
        };
        let payload = self
            .client
            .launch(&launch)
            .await
            .map_err(|e| ToolExecutionError::finish_workflow(format!("Launch failed: {e}")))?;

        if payload.get("isError").and_then(Value::as_bool) == Some(true) {
            let detail = payload.get("error").cloned().unwrap_or(Value::Null);
            return Err(ToolExecutionError::finish_workflow(format!(
                "Launch returned error: {detail}"
            )));
        }
        extract_branch_id(&payload).ok_or_else(|| {
            ToolExecutionError::finish_workflow(format!(
                "Missing branch id in launch response: {payload}"
            ))
        })
    }

    /// Poll until the branch reaches a terminal status or the deadline passes.
    async fn wait_for_terminal(&self, branch_id: &str) -> Result<BranchStatus, ToolExecutionError> {
        let timeout = self.poll.timeout;
        let deadline = self.poll.deadline_from(Instant::now());
        let mut backoff = Backoff::new(&self.poll);
        let mut last_status = String::new();
        let mut last_text: Option<String> = None;
        let mut attempt: u32 = 0;

        info!(branch_id, timeout_secs = timeout.as_secs(), "Checking branch status");
        loop {
            attempt += 1;
            self.counters.status_polls.fetch_add(1, Ordering::Relaxed);

            let payload = self.client.get_status(branch_id).await.map_err(|e| {
                ToolExecutionError::recoverable(format!(
                    "get_branch call failed for branch {branch_id}: {e}"
                ))
            })?;
            let status = BranchStatus::from_payload(&payload).map_err(|reason| {
                ToolExecutionError::recoverable(format!("Status for branch {branch_id} {reason}"))
            })?;

            if attempt == 1 || status.status != last_status || status.status_text != last_text {
                if !last_status.is_empty() && status.status != last_status {
                    info!(branch_id, from = %last_status, to = %status.status_label(), "Branch status changed");
                }
                let text = status
                    .status_text
                    .as_deref()
                    .map(|t| preview(t, STATUS_TEXT_LOG_CHARS))
                    .unwrap_or_default();
                info!(branch_id, attempt, status = %status.status_label(), status_text = %text, "Branch poll");
            } else {
                debug!(branch_id, attempt, status = %status.status_label(), "Branch poll");
            }

            if status.is_terminal() && self.snapshot_settled(&status).await {
                if status.phase() == BranchPhase::Failed {
                    return Err(self.failed_branch_error(branch_id, &status).await);
                }
                return Ok(status);
            }

            if Instant::now() > deadline {
                return Err(ToolExecutionError::finish_workflow(format!(
                    "Timed out waiting for branch {branch_id} (last status={})",
                    status.status_label()
                )));
            }

            let delay = backoff.next_delay();
            info!(
                branch_id,
                status = %status.status_label(),
                sleep_secs = delay.as_secs_f64(),
                "Branch still active"
            );
            last_status = status.status.clone();
            last_text = status.status_text.clone();
            tokio::time::sleep(delay).await;
        }
    }

    /// With the snapshot guard on, a terminal status only counts once the
    /// branch has a snapshot distinct from its parent's.
    async fn snapshot_settled(&self, status: &BranchStatus) -> bool {
        if !self.poll.require_new_snapshot {
            return true;
        }
        let Some(parent_id) = status.parent_id.as_deref() else {
            return true;
        };
        match self.client.get_status(parent_id).await {
            Ok(parent) => {
                let parent_snap = parent
                    .get("latest_snap_id")
                    .and_then(Value::as_str)
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty());
                match (parent_snap, status.latest_snap_id.as_deref()) {
                    (Some(parent_snap), Some(own)) => parent_snap != own,
                    (Some(_), None) => false,
                    _ => true,
                }
            }
            Err(err) => {
                warn!(parent_id, error = %err, "Parent branch lookup failed; deferring completion");
                false
            }
        }
    }

    async fn failed_branch_error(&self, branch_id: &str, status: &BranchStatus) -> ToolExecutionError {
        let excerpt = match self.client.fetch_output(branch_id, true).await {
            Ok(text) => {
                let text = text.trim();
                let (head, truncated) = truncate_text(text, FAILURE_EXCERPT_CHARS, false);
                if truncated {
                    format!("{head}...")
                } else {
                    head
                }
            }
            Err(_) => String::new(),
        };
        let message = if excerpt.is_empty() {
            format!("Branch {branch_id} reported failed status. Inspect manifest {branch_id}.")
        } else {
            format!(
                "Branch {branch_id} reported failed status: {excerpt}. Inspect manifest {branch_id}."
            )
        };
        ToolExecutionError::finish_workflow(message)
            .with_detail("status", status.status.clone())
            .with_detail("branch_id", status.branch_id.clone())
    }

    /// Prefer the complete log, fall back to the server-truncated one, then
    /// to whatever text the status payload carried.
    async fn collect_output(
        &self,
        branch_id: &str,
        status: &BranchStatus,
    ) -> Result<String, ToolExecutionError> {
        let fallback = status.fallback_output().unwrap_or_default();
        let fetched = match self.client.fetch_output(branch_id, true).await {
            Ok(text) => text,
            Err(full_err) => {
                warn!(branch_id, error = %full_err, "Full output fetch failed; retrying with default truncation");
                match self.client.fetch_output(branch_id, false).await {
                    Ok(text) => text,
                    Err(_) => return Err(output_error(branch_id, full_err)),
                }
            }
        };

        let text = if fetched.trim().is_empty() {
            fallback.trim()
        } else {
            fetched.trim()
        };
        if text.is_empty() {
            return Err(ToolExecutionError::recoverable(
                "branch_output returned no textual output",
            ));
        }
        Ok(text.to_string())
    }
}

fn output_error(branch_id: &str, err: ControlPlaneError) -> ToolExecutionError {
    ToolExecutionError::recoverable(format!("branch_output failed for {branch_id}: {err}"))
}

#[async_trait]
impl AgentExecutor for AgentDispatcher {
    async fn execute_agent(&self, request: &AgentRequest) -> Result<AgentRun, ToolExecutionError> {
        if request.agent.trim() == REVIEW_CODE_AGENT {
            self.execute_review_agent(request).await
        } else {
            self.run_agent(request).await
        }
    }

    async fn read_artifact(&self, branch_id: &str, path: &str) -> Result<Value, ToolExecutionError> {
        self.read_branch_artifact(branch_id, path).await
    }

    fn branch_range(&self) -> BranchRange {
        self.lineage().range()
    }
}
