//! The full PR review run.
//!
//! ```text
//! scout (optional, soft-fail) ──► review_code ──► has_issue? ──no──► clean
//!                                                     │yes
//!                                                     ▼
//!                                              split into issues
//!                                                     │
//!                                   ┌─────────────────┼─────────────────┐
//!                                   ▼                 ▼                 ▼
//!                             IssueVerifier     IssueVerifier     IssueVerifier   (concurrent)
//!                                   └─────────────────┼─────────────────┘
//!                                                     ▼
//!                                 drop both-rejected ──► result + statistics
//!                                                     │
//!                                                     ▼
//!                                       summary write-up (best effort)
//! ```

use std::sync::Arc;

use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::consensus::IssueVerifier;
use super::prompts::{
    has_issue_prompt, issue_finder_prompt, issue_splitter_prompt, scout_prompt, summary_report_prompt,
    HAS_ISSUE_SYSTEM, ISSUE_SPLITTER_SYSTEM,
};
use super::state::{IssueReport, ReviewResult, ReviewStatus, ReviewerLog};
use super::stats::StatsRecorder;
use super::steps::{StepRunner, WORKER_AGENT};
use super::VerificationError;
use crate::completion::{parse_json_object, ChatMessage, CompletionService};
use crate::dispatch::{AgentExecutor, REVIEW_CODE_AGENT};
use crate::events::EventStream;

pub const CHANGE_ANALYSIS_FILE: &str = "change_analysis.md";
pub const SUMMARY_REPORT_FILE: &str = "review_summary.md";

/// Inputs of one review run.
#[derive(Debug, Clone, Default)]
pub struct ReviewOptions {
    pub task: String,
    pub project_name: String,
    pub parent_branch_id: String,
    /// Agent-side directory for scout and summary artifacts.
    pub workspace_dir: Option<String>,
    pub skip_scout: bool,
}

impl ReviewOptions {
    fn normalized(mut self) -> Result<Self, VerificationError> {
        self.task = self.task.trim().to_string();
        self.project_name = self.project_name.trim().to_string();
        self.parent_branch_id = self.parent_branch_id.trim().to_string();
        self.workspace_dir = self
            .workspace_dir
            .map(|dir| dir.trim().trim_end_matches('/').to_string())
            .filter(|dir| !dir.is_empty());

        for (name, value) in [
            ("task", &self.task),
            ("project_name", &self.project_name),
            ("parent_branch_id", &self.parent_branch_id),
        ] {
            if value.is_empty() {
                return Err(VerificationError::InvalidOptions(format!("{name} is required")));
            }
        }
        Ok(self)
    }

    fn workspace_file(&self, file: &str) -> Option<String> {
        self.workspace_dir.as_ref().map(|dir| format!("{dir}/{file}"))
    }
}

pub struct ReviewRunner {
    completion: Arc<dyn CompletionService>,
    steps: StepRunner,
    options: ReviewOptions,
    stats: Arc<StatsRecorder>,
}

impl ReviewRunner {
    pub fn new(
        completion: Arc<dyn CompletionService>,
        executor: Arc<dyn AgentExecutor>,
        options: ReviewOptions,
    ) -> Result<Self, VerificationError> {
        let options = options.normalized()?;
        Ok(Self {
            completion,
            steps: StepRunner::new(executor, options.project_name.clone()),
            options,
            stats: Arc::new(StatsRecorder::new()),
        })
    }

    pub fn with_events(mut self, events: EventStream) -> Self {
        self.steps = self.steps.with_events(events);
        self
    }

    pub fn options(&self) -> &ReviewOptions {
        &self.options
    }

    pub async fn run(&self) -> Result<ReviewResult, VerificationError> {
        let parent = self.options.parent_branch_id.as_str();
        info!(task = %self.options.task, parent_branch_id = parent, "Starting PR review");

        let (review_parent, analysis_path) = if self.options.skip_scout {
            info!("Skipping scout stage by request");
            (parent.to_string(), None)
        } else {
            match self.scout(parent).await {
                Some((branch_id, path)) => (branch_id, Some(path)),
                None => (parent.to_string(), None),
            }
        };

        let review_log = self.review(&review_parent, analysis_path.as_deref()).await?;
        let reviewer_logs = vec![review_log.clone()];

        let issues = self.extract_issues(&review_log.report).await?;
        let reports = if issues.is_empty() {
            Vec::new()
        } else {
            self.verify_all(issues, &review_log.branch_id, analysis_path).await
        };

        let (dismissed, surviving): (Vec<IssueReport>, Vec<IssueReport>) =
            reports.into_iter().partition(IssueReport::is_dismissed);
        if !dismissed.is_empty() {
            info!(count = dismissed.len(), "Dropping issues rejected by both roles");
        }

        let mut result = ReviewResult::with_issues(&self.options.task, reviewer_logs, surviving);
        let range = self.steps.executor().branch_range();
        result.start_branch_id = range.start_branch_id;
        result.latest_branch_id = range.latest_branch_id;
        result.review_statistics = Some(self.stats.finish());

        if result.status == ReviewStatus::IssuesFound {
            result.summary_branch_id = self.summary(&result).await;
        }
        info!(status = ?result.status, summary = %result.summary, "PR review finished");
        Ok(result)
    }

    /// Scout stage. Any failure is recorded and the run continues without analysis.
    async fn scout(&self, parent: &str) -> Option<(String, String)> {
        let started = self.stats.start_step("scout");
        let outcome = self.try_scout(parent).await;
        self.stats.end_step("scout", started);
        match outcome {
            Ok(found) => {
                info!(branch_id = %found.0, path = %found.1, "Scout wrote change analysis");
                Some(found)
            }
            Err(message) => {
                warn!(error = %message, "Scout soft-failed; continuing without change analysis");
                self.stats.record_abnormal("scout", format!("scout soft-failed: {message}"));
                None
            }
        }
    }

    async fn try_scout(&self, parent: &str) -> Result<(String, String), String> {
        let path = self
            .options
            .workspace_file(CHANGE_ANALYSIS_FILE)
            .ok_or_else(|| "workspace dir is required for scout output".to_string())?;
        let run = self
            .steps
            .run("scout", WORKER_AGENT, scout_prompt(&self.options.task, &path), parent)
            .await
            .map_err(|e| format!("execute_agent failed: {}", e.message))?;
        let content = self
            .steps
            .read_text(&run.branch_id, &path)
            .await
            .map_err(|e| format!("read_artifact failed: {}", e.message))?;
        if content.is_empty() {
            return Err(format!("scout wrote empty analysis file: {path}"));
        }
        Ok((run.branch_id, path))
    }

    async fn review(&self, parent: &str, analysis_path: Option<&str>) -> Result<ReviewerLog, VerificationError> {
        let started = self.stats.start_step("review");
        let result = self
            .steps
            .run(
                "review",
                REVIEW_CODE_AGENT,
                issue_finder_prompt(&self.options.task, analysis_path),
                parent,
            )
            .await;
        self.stats.end_step("review", started);

        let run = result.map_err(|source| {
            self.stats
                .record_abnormal("review", format!("execute_agent failed: {}", source.message));
            VerificationError::Step {
                step: "review".into(),
                source,
            }
        })?;
        let report = run.review_report.as_deref().map(str::trim).unwrap_or_default();
        if report.is_empty() {
            return Err(VerificationError::EmptyReview);
        }
        Ok(ReviewerLog {
            branch_id: run.branch_id,
            report: report.to_string(),
        })
    }

    /// Pre-filter then split. Empty means clean.
    async fn extract_issues(&self, report: &str) -> Result<Vec<String>, VerificationError> {
        let reply = self
            .completion
            .complete(
                &[ChatMessage::system(HAS_ISSUE_SYSTEM), ChatMessage::user(has_issue_prompt(report))],
                &[],
            )
            .await?;
        if !parse_has_issue(&reply.content).map_err(VerificationError::PreFilter)? {
            info!("Pre-filter found no blocking issue");
            return Ok(Vec::new());
        }

        let split = self
            .completion
            .complete(
                &[
                    ChatMessage::system(ISSUE_SPLITTER_SYSTEM),
                    ChatMessage::user(issue_splitter_prompt(report)),
                ],
                &[],
            )
            .await;
        let issues = match split {
            Ok(reply) => split_issues(report, &reply.content),
            Err(err) => {
                warn!(error = %err, "Issue splitter failed; treating report as a single issue");
                vec![report.trim().to_string()]
            }
        };
        info!(count = issues.len(), "Parsed issues from review report");
        Ok(issues)
    }

    /// Verify every issue concurrently; failed verifications are recorded as abnormal and dropped.
    async fn verify_all(&self, issues: Vec<String>, start_branch_id: &str, analysis_path: Option<String>) -> Vec<IssueReport> {
        let verifier = Arc::new(
            IssueVerifier::new(self.steps.clone(), self.stats.clone(), self.options.task.clone())
                .with_analysis_path(analysis_path),
        );
        let total = issues.len();
        let mut set = JoinSet::new();
        for (index, issue) in issues.into_iter().enumerate() {
            let verifier = verifier.clone();
            let start = start_branch_id.to_string();
            set.spawn(async move {
                info!(issue = index + 1, total, "Verifying issue");
                (index, verifier.verify(&issue, &start).await)
            });
        }

        let mut verified = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(report))) => verified.push((index, report)),
                Ok((index, Err(err))) => {
                    error!("Issue {}/{} verification failed: {}", index + 1, total, err);
                    self.stats
                        .record_abnormal(&format!("issue_{}", index + 1), format!("verification failed: {err}"));
                }
                Err(err) => {
                    error!(error = %err, "Issue verification task aborted");
                    self.stats
                        .record_abnormal("verify_issue", format!("verification task aborted: {err}"));
                }
            }
        }
        verified.sort_by_key(|(index, _)| *index);
        verified.into_iter().map(|(_, report)| report).collect()
    }

    /// Human-readable write-up from the original parent; failures are only logged.
    async fn summary(&self, result: &ReviewResult) -> Option<String> {
        let Some(path) = self.options.workspace_file(SUMMARY_REPORT_FILE) else {
            error!("workspace dir is required for summary report output");
            return None;
        };
        let result_json = match serde_json::to_string_pretty(result) {
            Ok(json) => json,
            Err(err) => {
                error!(error = %err, "Failed to serialize review result for summary");
                return None;
            }
        };
        let prompt = summary_report_prompt(&self.options.task, &result_json, &path);
        match self
            .steps
            .run("summary", WORKER_AGENT, prompt, &self.options.parent_branch_id)
            .await
        {
            Ok(run) if !run.branch_id.trim().is_empty() => {
                info!(branch_id = %run.branch_id, "Summary report generated");
                Some(run.branch_id)
            }
            Ok(_) => {
                warn!("Summary report run returned no branch id");
                None
            }
            Err(err) => {
                error!(error = %err, "Failed to generate summary report");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct HasIssueReply {
    has_issue: bool,
}

#[derive(Debug, Deserialize)]
struct SplitReply {
    #[serde(default)]
    issues: Vec<SplitIssue>,
}

#[derive(Debug, Deserialize)]
struct SplitIssue {
    #[serde(default)]
    text: String,
}

/// `{"has_issue": bool}` out of a pre-filter reply.
pub fn parse_has_issue(content: &str) -> Result<bool, String> {
    let obj = parse_json_object(content)?;
    serde_json::from_value::<HasIssueReply>(serde_json::Value::Object(obj))
        .map(|reply| reply.has_issue)
        .map_err(|e| e.to_string())
}

/// Issue texts out of a splitter reply, falling back to the whole report.
pub fn split_issues(report: &str, content: &str) -> Vec<String> {
    let whole = || vec![report.trim().to_string()];
    let parsed = parse_json_object(content)
        .and_then(|obj| serde_json::from_value::<SplitReply>(serde_json::Value::Object(obj)).map_err(|e| e.to_string()));
    let reply = match parsed {
        Ok(reply) => reply,
        Err(err) => {
            warn!(error = %err, "Unparsable issue list; treating report as a single issue");
            return whole();
        }
    };

    if reply.issues.is_empty() {
        let lower = report.to_lowercase();
        if lower.contains("no p0/p1 issues found") || lower.contains("no p0/p1 issue") {
            return Vec::new();
        }
        warn!("Empty issue list; treating report as a single issue");
        return whole();
    }

    let issues: Vec<String> = reply
        .issues
        .into_iter()
        .map(|issue| issue.text.trim().to_string())
        .filter(|text| !text.is_empty())
        .collect();
    if issues.is_empty() {
        return whole();
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_has_issue() {
        assert_eq!(parse_has_issue(r#"{"has_issue": true}"#), Ok(true));
        assert_eq!(parse_has_issue("```json\n{\"has_issue\": false}\n```"), Ok(false));
        assert!(parse_has_issue("yes").is_err());
        assert!(parse_has_issue(r#"{"issue": true}"#).is_err());
    }

    #[test]
    fn test_split_issues_fallbacks() {
        let report = "P0: crash in parser\nP1: leak in cache";
        assert_eq!(split_issues(report, "not json"), vec![report.to_string()]);
        assert_eq!(split_issues(report, r#"{"issues": []}"#), vec![report.to_string()]);
        assert_eq!(
            split_issues(report, r#"{"issues": [{"text": "  "}, {"text": ""}]}"#),
            vec![report.to_string()]
        );
        assert!(split_issues("Summary: No P0/P1 issues found.", r#"{"issues": []}"#).is_empty());
    }

    #[test]
    fn test_split_issues_keeps_non_blank_texts() {
        let content = r#"{"issues": [{"text": " P0: crash ", "priority": "P0"}, {"text": ""}, {"text": "P1: leak", "priority": "P1"}]}"#;
        assert_eq!(split_issues("r", content), vec!["P0: crash".to_string(), "P1: leak".to_string()]);
    }

    #[test]
    fn test_options_validation() {
        let options = ReviewOptions {
            task: " review #3 ".into(),
            project_name: "demo".into(),
            parent_branch_id: "b-0".into(),
            workspace_dir: Some("/ws/".into()),
            skip_scout: false,
        }
        .normalized()
        .unwrap();
        assert_eq!(options.task, "review #3");
        assert_eq!(options.workspace_file(SUMMARY_REPORT_FILE).as_deref(), Some("/ws/review_summary.md"));

        let err = ReviewOptions {
            task: "t".into(),
            project_name: "  ".into(),
            parent_branch_id: "b".into(),
            ..Default::default()
        }
        .normalized()
        .unwrap_err();
        assert!(err.to_string().contains("project_name is required"));
    }
}
