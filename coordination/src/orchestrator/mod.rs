//! Turn-based orchestration of a development run.
//!
//! ```text
//! initial messages ──► TurnLoop ──► FinalReport
//!                        │  ▲            │
//!             one tool   │  │ tool       ▼
//!             call/turn  ▼  │ result   attach lineage → sanitize
//!                     ToolExecutor       → finalize (optional) → sanitize
//! ```
//!
//! Every run ends with exactly one report. `iteration_limit` is a resumable
//! outcome, not an error: rerun with `latest_branch_id` as the parent.

pub mod finalizer;
pub mod prompts;
pub mod report;
pub mod turn_loop;

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::completion::CompletionService;
use crate::events::{EventStream, RunEvent};
use crate::tools::ToolExecutor;

pub use finalizer::{FinalizeError, ReportFinalizer};
pub use prompts::{initial_messages, system_prompt, RunContext};
pub use report::{
    parse_final_report, FinalReport, ITERATION_LIMIT_SUMMARY, STATUS_COMPLETED,
    STATUS_FINISHED_WITH_ERROR, STATUS_ITERATION_LIMIT, TOOL_ERROR_SUMMARY,
};
pub use turn_loop::{LoopOutcome, RunError, TurnLimits, TurnLoop, POLICY_ABORT_SUMMARY};

/// One development run: loop, lineage attachment and report clean-up.
pub struct DevSession {
    turn_loop: TurnLoop,
    tools: Arc<dyn ToolExecutor>,
    finalizer: Option<ReportFinalizer>,
    events: EventStream,
}

impl DevSession {
    pub fn new(completion: Arc<dyn CompletionService>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            turn_loop: TurnLoop::new(completion.clone(), tools.clone()),
            tools,
            finalizer: Some(ReportFinalizer::new(completion)),
            events: EventStream::disabled(),
        }
    }

    pub fn with_limits(mut self, limits: TurnLimits) -> Self {
        self.turn_loop = self.turn_loop.with_limits(limits);
        self
    }

    pub fn with_events(mut self, events: EventStream) -> Self {
        self.turn_loop = self.turn_loop.with_events(events.clone());
        self.events = events;
        self
    }

    pub fn without_finalizer(mut self) -> Self {
        self.finalizer = None;
        self
    }

    pub async fn run(&self, context: &RunContext, playbook: Option<&str>) -> Result<FinalReport, RunError> {
        let task = context.task.trim();
        self.events.emit(RunEvent::ThreadStarted {
            task: task.to_string(),
            project_name: context.project_name.clone(),
            parent_branch_id: context.parent_branch_id.clone(),
            headless: true,
        });

        let outcome = match self.turn_loop.run(task, initial_messages(context, playbook)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.events.emit(RunEvent::Error {
                    scope: "cli".into(),
                    message: err.to_string(),
                    extra: Value::Null,
                });
                self.events.emit(RunEvent::ThreadCompleted {
                    status: "error".into(),
                    summary: err.to_string(),
                    report: Value::Null,
                });
                return Err(err);
            }
        };
        info!(
            turns = outcome.turns,
            tool_calls = outcome.executed_tool_calls,
            status = %outcome.report.status(),
            "Orchestration loop finished"
        );

        let mut report = outcome.report;
        report.attach_lineage(&self.tools.branch_range());
        report.ensure_defaults(task, "");
        report.sanitize();
        if let Some(finalizer) = &self.finalizer {
            report = finalizer.finalize_or_keep(report).await;
            report.sanitize();
        }

        self.events.emit(RunEvent::ThreadCompleted {
            status: report.status().to_string(),
            summary: report.summary.clone().unwrap_or_default(),
            report: report.to_json(),
        });
        Ok(report)
    }
}
