//! Agent dispatch for review steps, with event items around each call.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{info, warn};

use crate::control_plane::artifact_content;
use crate::dispatch::{AgentExecutor, AgentRequest, AgentRun};
use crate::error::ToolExecutionError;
use crate::events::{EventStream, ItemKind, ItemStatus, RunEvent, PROMPT_PREVIEW_CHARS};
use crate::truncate::preview;

/// Agent used for scout, role and summary runs.
pub const WORKER_AGENT: &str = "codex";

#[derive(Clone)]
pub struct StepRunner {
    executor: Arc<dyn AgentExecutor>,
    project_name: String,
    events: EventStream,
}

impl StepRunner {
    pub fn new(executor: Arc<dyn AgentExecutor>, project_name: impl Into<String>) -> Self {
        Self {
            executor,
            project_name: project_name.into(),
            events: EventStream::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventStream) -> Self {
        self.events = events;
        self
    }

    pub fn executor(&self) -> &Arc<dyn AgentExecutor> {
        &self.executor
    }

    /// Run `agent` from `parent_branch_id` as the step named `step`.
    pub async fn run(
        &self,
        step: &str,
        agent: &str,
        prompt: String,
        parent_branch_id: &str,
    ) -> Result<AgentRun, ToolExecutionError> {
        let item_id = self.events.next_item_id();
        self.events.emit(RunEvent::ItemStarted {
            item_id: item_id.clone(),
            kind: ItemKind::ReviewStep,
            name: step.to_string(),
            args: json!({
                "agent": agent,
                "parent_branch_id": parent_branch_id,
                "prompt_preview": preview(&prompt, PROMPT_PREVIEW_CHARS),
            }),
        });
        info!(step, agent, parent_branch_id, "Dispatching review step");

        let request = AgentRequest::new(agent, prompt, parent_branch_id).with_project(self.project_name.clone());
        let started = Instant::now();
        let result = self.executor.execute_agent(&request).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let (status, branch_id, summary) = match &result {
            Ok(run) => (
                ItemStatus::Success,
                Some(run.branch_id.clone()),
                Some(preview(&run.response, PROMPT_PREVIEW_CHARS)).filter(|s| !s.is_empty()),
            ),
            Err(err) => {
                warn!(step, error = %err, "Review step failed");
                (ItemStatus::Error, None, Some(format!("execute_agent failed: {}", err.message)))
            }
        };
        self.events.emit(RunEvent::ItemCompleted {
            item_id,
            status,
            duration_ms,
            branch_id,
            summary,
        });
        result
    }

    /// Text of a file on a branch; empty when the file is blank.
    pub async fn read_text(&self, branch_id: &str, path: &str) -> Result<String, ToolExecutionError> {
        let payload = self.executor.read_artifact(branch_id, path).await?;
        Ok(artifact_content(&payload).map(str::trim).unwrap_or_default().to_string())
    }
}
