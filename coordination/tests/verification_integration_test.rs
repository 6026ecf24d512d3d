//! Integration tests for the verification consensus engine and the PR review
//! pipeline, driven by scripted agent and LLM fakes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use coordination::completion::{AssistantTurn, ChatMessage, CompletionError, CompletionService, ToolDefinition};
use coordination::dispatch::{AgentExecutor, AgentRequest, AgentRun, ExcerptMode, OutputHint, OutputRequest};
use coordination::lineage::{BranchLineage, BranchRange};
use coordination::verification::{
    Consensus, IssueStatus, IssueVerifier, ReviewOptions, ReviewRunner, ReviewStatus, StatsRecorder, StepRunner,
    VerificationError, Verdict, VerifierRole, CLEAN_SUMMARY,
};
use coordination::ToolExecutionError;

const CONFIRMED: &str = "# VERDICT: CONFIRMED\n\nReproduced with cargo test.";
const REJECTED: &str = "# VERDICT: REJECTED\n\nThe guard on line 40 prevents it.";

// ── Fakes ──────────────────────────────────────────────────────

/// Agent executor answering by prompt content.
///
/// The first rule whose needles all occur in the prompt decides the reply.
/// Branch ids are handed out in call order (`b1`, `b2`, ...).
#[derive(Default)]
struct ScriptedAgents {
    rules: Vec<(Vec<String>, Result<String, String>)>,
    review_report: Option<String>,
    artifacts: HashMap<String, String>,
    calls: Mutex<Vec<(String, AgentRequest)>>,
    lineage: Mutex<BranchLineage>,
}

impl ScriptedAgents {
    fn reply(mut self, needles: &[&str], reply: Result<&str, &str>) -> Self {
        self.rules.push((
            needles.iter().map(|n| n.to_string()).collect(),
            reply.map(str::to_string).map_err(str::to_string),
        ));
        self
    }

    fn review_report(mut self, report: &str) -> Self {
        self.review_report = Some(report.to_string());
        self
    }

    fn artifact(mut self, path: &str, content: &str) -> Self {
        self.artifacts.insert(path.to_string(), content.to_string());
        self
    }

    fn calls(&self) -> Vec<(String, AgentRequest)> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_matching(&self, needle: &str) -> Vec<(String, AgentRequest)> {
        self.calls()
            .into_iter()
            .filter(|(_, req)| req.prompt.contains(needle))
            .collect()
    }
}

fn agent_run(branch_id: &str, response: &str, review_report: Option<String>) -> AgentRun {
    AgentRun {
        branch_id: branch_id.to_string(),
        status: "succeed".to_string(),
        response: response.to_string(),
        response_truncated: false,
        response_max_chars: 8000,
        response_excerpt_mode: ExcerptMode::Tail,
        full_output_hint: OutputHint::branch_output(OutputRequest::tail_of(branch_id)),
        review_report,
    }
}

#[async_trait]
impl AgentExecutor for ScriptedAgents {
    async fn execute_agent(&self, request: &AgentRequest) -> Result<AgentRun, ToolExecutionError> {
        let branch_id = {
            let mut calls = self.calls.lock().unwrap();
            let id = format!("b{}", calls.len() + 1);
            calls.push((id.clone(), request.clone()));
            id
        };

        if request.agent == "review_code" {
            self.lineage.lock().unwrap().record(&branch_id);
            return Ok(agent_run(&branch_id, "review done", self.review_report.clone()));
        }

        let reply = self
            .rules
            .iter()
            .find(|(needles, _)| needles.iter().all(|n| request.prompt.contains(n.as_str())))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| Ok("done".to_string()));
        match reply {
            Ok(text) => {
                self.lineage.lock().unwrap().record(&branch_id);
                Ok(agent_run(&branch_id, &text, None))
            }
            Err(message) => Err(ToolExecutionError::finish_workflow(message)),
        }
    }

    async fn read_artifact(&self, _branch_id: &str, path: &str) -> Result<Value, ToolExecutionError> {
        match self.artifacts.get(path) {
            Some(content) => Ok(json!({ "content": content })),
            None => Err(ToolExecutionError::recoverable(format!("not found: {path}"))),
        }
    }

    fn branch_range(&self) -> BranchRange {
        self.lineage.lock().unwrap().range()
    }
}

/// LLM fake replaying scripted replies and recording each request.
#[derive(Default)]
struct ScriptedCompletion {
    replies: Mutex<VecDeque<Result<AssistantTurn, CompletionError>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedCompletion {
    fn with_replies(replies: &[&str]) -> Self {
        let fake = Self::default();
        for reply in replies {
            fake.replies.lock().unwrap().push_back(Ok(AssistantTurn::text(*reply)));
        }
        fake
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<AssistantTurn, CompletionError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(CompletionError::Empty))
    }
}

fn verifier(agents: &Arc<ScriptedAgents>) -> (IssueVerifier, Arc<StatsRecorder>) {
    let stats = Arc::new(StatsRecorder::new());
    let steps = StepRunner::new(agents.clone(), "demo");
    (IssueVerifier::new(steps, stats.clone(), "Review PR #7"), stats)
}

const ISSUE: &str = "P0: panic in parse_header on empty input";

// ── Consensus ──────────────────────────────────────────────────

#[tokio::test]
async fn test_both_confirm_in_round_one() {
    let agents = Arc::new(
        ScriptedAgents::default()
            .reply(&["Role: REVIEWER"], Ok(CONFIRMED))
            .reply(&["Role: TESTER"], Ok(CONFIRMED)),
    );
    let (verifier, stats) = verifier(&agents);

    let report = verifier.verify(ISSUE, "review-branch").await.unwrap();

    assert_eq!(report.status, IssueStatus::Confirmed);
    assert_eq!(report.consensus, Some(Consensus::BothConfirmed));
    assert_eq!(report.exchange_rounds, 0);
    assert_eq!(report.round_branches.len(), 1);
    assert!(report.verdict_explanation.contains("Round 1"));
    assert!(report.verdict_explanation.contains("consistent"));

    // Both roles start from the same branch.
    let calls = agents.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(_, req)| req.parent_branch_id == "review-branch"));
    assert!(calls.iter().all(|(_, req)| req.project_name == "demo"));

    let stats = stats.finish();
    assert_eq!(stats.issue_statistics[ISSUE].steps, 2);
    assert_eq!(stats.total_steps, 2);
}

#[tokio::test]
async fn test_exchange_round_reaches_agreement() {
    let agents = Arc::new(
        ScriptedAgents::default()
            .reply(&["Round 2", "Role: TESTER"], Ok("# VERDICT: CONFIRMED\n\nNow reproduced."))
            .reply(&["Role: REVIEWER"], Ok(CONFIRMED))
            .reply(&["Role: TESTER"], Ok(REJECTED)),
    );
    let (verifier, _) = verifier(&agents);

    let report = verifier.verify(ISSUE, "review-branch").await.unwrap();

    assert_eq!(report.status, IssueStatus::Confirmed);
    assert_eq!(report.exchange_rounds, 1);
    assert_eq!(report.round_branches.len(), 2);
    assert_eq!(report.verifier.as_ref().unwrap().round, 2);
    assert!(report.verdict_explanation.starts_with("Round 2"));

    // Each role continues from its own round-1 branch.
    let first = &report.round_branches[0];
    let exchanges = agents.calls_matching("Round 2: Exchange");
    assert_eq!(exchanges.len(), 2);
    let (_, reviewer_call) = exchanges.iter().find(|(_, r)| r.prompt.contains("Role: REVIEWER")).unwrap();
    let (_, tester_call) = exchanges.iter().find(|(_, r)| r.prompt.contains("Role: TESTER")).unwrap();
    assert_eq!(Some(&reviewer_call.parent_branch_id), first.reviewer_branch_id.as_ref());
    assert_eq!(Some(&tester_call.parent_branch_id), first.verifier_branch_id.as_ref());

    // The tester sees the reviewer's fresh answer as its peer opinion.
    assert!(tester_call.prompt.contains("<<<PEER_OPINION>>>"));
    assert!(tester_call.prompt.contains("Peer Verdict: confirmed"));
    assert!(reviewer_call.prompt.contains("Peer Verdict: rejected"));
}

#[tokio::test]
async fn test_persistent_disagreement_is_unresolved() {
    let agents = Arc::new(
        ScriptedAgents::default()
            .reply(&["Role: REVIEWER"], Ok(CONFIRMED))
            .reply(&["Role: TESTER"], Ok(REJECTED)),
    );
    let (verifier, stats) = verifier(&agents);

    let report = verifier.verify(ISSUE, "review-branch").await.unwrap();

    assert_eq!(report.status, IssueStatus::Unresolved);
    assert_eq!(report.consensus, Some(Consensus::Split));
    assert_eq!(report.exchange_rounds, 2);
    assert_eq!(report.round_branches.len(), 3);
    assert!(report.verdict_explanation.contains("After 3 rounds"));
    assert!(report.verdict_explanation.contains("when in doubt, do not report"));
    assert_eq!(agents.calls().len(), 6);

    let stat = &stats.finish().issue_statistics[ISSUE];
    assert_eq!((stat.reviewer_rounds, stat.verifier_rounds, stat.steps), (3, 3, 6));
}

#[tokio::test]
async fn test_both_reject_is_not_confirmed() {
    let agents = Arc::new(ScriptedAgents::default().reply(&["VERDICT"], Ok(REJECTED)));
    let (verifier, _) = verifier(&agents);

    let report = verifier.verify(ISSUE, "review-branch").await.unwrap();

    assert_eq!(report.status, IssueStatus::Unresolved);
    assert_eq!(report.consensus, Some(Consensus::BothRejected));
    assert!(report.is_dismissed());
    assert_eq!(report.exchange_rounds, 0);
}

#[tokio::test]
async fn test_both_reject_in_round_two_stops_early() {
    let agents = Arc::new(
        ScriptedAgents::default()
            .reply(&["Round 2", "Role: REVIEWER"], Ok("# VERDICT: REJECTED\n\nThe tester is right."))
            .reply(&["Role: REVIEWER"], Ok(CONFIRMED))
            .reply(&["Role: TESTER"], Ok(REJECTED)),
    );
    let (verifier, stats) = verifier(&agents);

    let report = verifier.verify(ISSUE, "review-branch").await.unwrap();

    assert_eq!(report.status, IssueStatus::Unresolved);
    assert_eq!(report.consensus, Some(Consensus::BothRejected));
    assert_eq!(report.exchange_rounds, 1);
    assert_eq!(report.round_branches.len(), 2);
    assert!(report.verdict_explanation.starts_with("Round 2"));
    assert!(report.is_dismissed());
    assert!(agents.calls_matching("Round 3").is_empty());
    assert_eq!(agents.calls().len(), 4);

    // Dismissed issues leave no per-issue statistics behind.
    assert!(stats.finish().issue_statistics.is_empty());
}

#[tokio::test]
async fn test_missing_marker_counts_as_rejected() {
    let agents = Arc::new(
        ScriptedAgents::default()
            .reply(&["Role: REVIEWER"], Ok("Looks like a real bug to me."))
            .reply(&["Role: TESTER"], Ok(REJECTED)),
    );
    let (verifier, _) = verifier(&agents);

    let report = verifier.verify(ISSUE, "review-branch").await.unwrap();

    assert_eq!(report.reviewer.verdict, Verdict::Rejected);
    assert_eq!(report.reviewer.verdict_reason, "missing explicit transcript verdict marker");
    assert_eq!(report.consensus, Some(Consensus::BothRejected));
}

#[tokio::test]
async fn test_verifier_failure_falls_back_to_reviewer_only() {
    let agents = Arc::new(
        ScriptedAgents::default()
            .reply(&["Role: REVIEWER"], Ok(CONFIRMED))
            .reply(&["Role: TESTER"], Err("branch crashed")),
    );
    let (verifier, stats) = verifier(&agents);

    let report = verifier.verify(ISSUE, "review-branch").await.unwrap();

    assert_eq!(report.status, IssueStatus::Unresolved);
    assert!(report.consensus.is_none());
    assert!(report.verifier.is_none());
    assert_eq!(report.reviewer.verdict, Verdict::Confirmed);
    assert!(report.verdict_explanation.contains("verifier failed: branch crashed"));
    assert!(report.round_branches[0].verifier_branch_id.is_none());

    let stats = stats.finish();
    assert_eq!(stats.abnormal_steps.len(), 1);
    assert_eq!(stats.abnormal_steps[0].step_name, "verifier_round1");
    assert_eq!(stats.issue_statistics[ISSUE].verifier_rounds, 0);
}

#[tokio::test]
async fn test_reviewer_failure_in_round_one_is_an_error() {
    let agents = Arc::new(
        ScriptedAgents::default()
            .reply(&["Role: REVIEWER"], Err("launch refused"))
            .reply(&["Role: TESTER"], Ok(CONFIRMED)),
    );
    let (verifier, _) = verifier(&agents);

    let err = verifier.verify(ISSUE, "review-branch").await.unwrap_err();

    match err {
        VerificationError::Agent { role, round, .. } => {
            assert_eq!(role, VerifierRole::Reviewer);
            assert_eq!(round, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_exchange_failure_reuses_previous_transcript() {
    let agents = Arc::new(
        ScriptedAgents::default()
            .reply(&["Round 2", "Role: REVIEWER"], Err("timed out"))
            .reply(&["Round 3", "Role: REVIEWER"], Ok(REJECTED))
            .reply(&["Role: REVIEWER"], Ok(CONFIRMED))
            .reply(&["Role: TESTER"], Ok(REJECTED)),
    );
    let (verifier, _) = verifier(&agents);

    let report = verifier.verify(ISSUE, "review-branch").await.unwrap();

    let round_two = &report.round_branches[1];
    assert!(round_two.reviewer_branch_id.is_none());
    assert!(round_two.verifier_branch_id.is_some());
    assert_eq!(report.consensus, Some(Consensus::BothRejected));
    assert_eq!(report.exchange_rounds, 2);
    assert_eq!(report.reviewer.round, 3);

    // Round 3 reviewer continues from its round-1 branch.
    let round_three = agents.calls_matching("Round 3: Exchange");
    let (_, reviewer_call) = round_three.iter().find(|(_, r)| r.prompt.contains("Role: REVIEWER")).unwrap();
    assert_eq!(Some(&reviewer_call.parent_branch_id), report.round_branches[0].reviewer_branch_id.as_ref());
}

// ── Review pipeline ────────────────────────────────────────────

fn options(skip_scout: bool) -> ReviewOptions {
    ReviewOptions {
        task: "Review PR #7".into(),
        project_name: "demo".into(),
        parent_branch_id: "parent-0".into(),
        workspace_dir: Some("/ws".into()),
        skip_scout,
    }
}

#[tokio::test]
async fn test_prefilter_negative_is_clean() {
    let agents = Arc::new(ScriptedAgents::default().review_report("No P0/P1 issues found."));
    let llm = Arc::new(ScriptedCompletion::with_replies(&[r#"{"has_issue": false}"#]));
    let runner = ReviewRunner::new(llm.clone(), agents.clone(), options(true)).unwrap();

    let result = runner.run().await.unwrap();

    assert_eq!(result.status, ReviewStatus::Clean);
    assert_eq!(result.summary, CLEAN_SUMMARY);
    assert_eq!(result.reviewer_logs.len(), 1);
    assert!(result.issues.is_empty());
    assert!(result.summary_branch_id.is_none());
    assert!(result.review_statistics.is_some());
    assert_eq!(llm.request_count(), 1);

    let calls = agents.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.agent, "review_code");
    assert_eq!(calls[0].1.parent_branch_id, "parent-0");
}

#[tokio::test]
async fn test_issues_found_drops_both_rejected() {
    let agents = Arc::new(
        ScriptedAgents::default()
            .review_report("P0: panic in parse_header\nP1: leak in cache")
            .artifact("/ws/change_analysis.md", "touches parser and cache")
            .reply(&["scout"], Ok("analysis written"))
            .reply(&["parse_header", "VERDICT"], Ok(CONFIRMED))
            .reply(&["leak in cache", "VERDICT"], Ok(REJECTED)),
    );
    let llm = Arc::new(ScriptedCompletion::with_replies(&[
        r#"{"has_issue": true}"#,
        r#"{"issues": [{"text": "P0: panic in parse_header", "priority": "P0"}, {"text": "P1: leak in cache", "priority": "P1"}]}"#,
    ]));
    let runner = ReviewRunner::new(llm, agents.clone(), options(false)).unwrap();

    let result = runner.run().await.unwrap();

    assert_eq!(result.status, ReviewStatus::IssuesFound);
    assert_eq!(result.summary, "Identified 1 P0/P1 issues (1 confirmed, 0 unresolved).");
    assert_eq!(result.issues.len(), 1);
    assert_eq!(result.issues[0].issue_text, "P0: panic in parse_header");
    assert!(result.summary_branch_id.is_some());
    assert!(result.start_branch_id.is_some());

    // Review continues from the scout branch; the summary from the original parent.
    let scout_branch = agents.calls_matching("scout")[0].0.clone();
    let review_call = agents.calls().into_iter().find(|(_, r)| r.agent == "review_code").unwrap();
    assert_eq!(review_call.1.parent_branch_id, scout_branch);
    assert!(review_call.1.prompt.contains("/ws/change_analysis.md"));
    let summary_call = agents.calls_matching("/ws/review_summary.md");
    assert_eq!(summary_call.len(), 1);
    assert_eq!(summary_call[0].1.parent_branch_id, "parent-0");

    // Both issues were verified from the review branch.
    let role_calls: Vec<_> = agents.calls_matching("Role: ").into_iter().map(|(_, r)| r).collect();
    assert_eq!(role_calls.len(), 4);
    assert!(role_calls.iter().all(|r| r.parent_branch_id == review_call.0));

    // Only the surviving issue carries statistics.
    let stats = result.review_statistics.unwrap();
    assert_eq!(stats.issue_statistics.len(), 1);
    assert!(stats.issue_statistics.contains_key("P0: panic in parse_header"));
    assert!(stats.step_timings.iter().any(|t| t.step_name == "scout"));
}

#[tokio::test]
async fn test_scout_soft_failure_continues_from_parent() {
    let agents = Arc::new(
        ScriptedAgents::default()
            .review_report("No P0/P1 issues found.")
            .artifact("/ws/change_analysis.md", "   ")
            .reply(&["scout"], Ok("done")),
    );
    let llm = Arc::new(ScriptedCompletion::with_replies(&[r#"{"has_issue": false}"#]));
    let runner = ReviewRunner::new(llm, agents.clone(), options(false)).unwrap();

    let result = runner.run().await.unwrap();

    assert_eq!(result.status, ReviewStatus::Clean);
    let review_call = agents.calls().into_iter().find(|(_, r)| r.agent == "review_code").unwrap();
    assert_eq!(review_call.1.parent_branch_id, "parent-0");
    assert!(!review_call.1.prompt.contains("change_analysis.md"));

    let stats = result.review_statistics.unwrap();
    assert_eq!(stats.abnormal_steps.len(), 1);
    assert!(stats.abnormal_steps[0].description.contains("scout wrote empty analysis file"));
}

#[tokio::test]
async fn test_empty_review_report_is_an_error() {
    let agents = Arc::new(ScriptedAgents::default().review_report("   "));
    let llm = Arc::new(ScriptedCompletion::default());
    let runner = ReviewRunner::new(llm, agents, options(true)).unwrap();

    let err = runner.run().await.unwrap_err();
    assert!(matches!(err, VerificationError::EmptyReview));
}

#[tokio::test]
async fn test_unparsable_prefilter_reply_is_an_error() {
    let agents = Arc::new(ScriptedAgents::default().review_report("P0: crash"));
    let llm = Arc::new(ScriptedCompletion::with_replies(&["maybe?"]));
    let runner = ReviewRunner::new(llm, agents, options(true)).unwrap();

    let err = runner.run().await.unwrap_err();
    assert!(err.to_string().contains("has_issue"));
}

#[tokio::test]
async fn test_failed_verification_is_excluded() {
    let agents = Arc::new(
        ScriptedAgents::default()
            .review_report("P0: panic in parse_header\nP1: leak in cache")
            .reply(&["parse_header", "Role: REVIEWER"], Err("launch refused"))
            .reply(&["leak in cache", "VERDICT"], Ok(CONFIRMED)),
    );
    let llm = Arc::new(ScriptedCompletion::with_replies(&[
        r#"{"has_issue": true}"#,
        r#"{"issues": [{"text": "P0: panic in parse_header"}, {"text": "P1: leak in cache"}]}"#,
    ]));
    let runner = ReviewRunner::new(llm, agents, options(true)).unwrap();

    let result = runner.run().await.unwrap();

    assert_eq!(result.issues.len(), 1);
    assert_eq!(result.issues[0].issue_text, "P1: leak in cache");
    assert_eq!(result.summary, "Identified 1 P0/P1 issues (1 confirmed, 0 unresolved).");

    let stats = result.review_statistics.unwrap();
    let failed = stats
        .abnormal_steps
        .iter()
        .find(|s| s.step_name == "issue_1")
        .expect("failed verification recorded");
    assert!(failed.description.contains("verification failed"));
    assert_eq!(stats.issue_statistics.len(), 1);
}

#[tokio::test]
async fn test_splitter_failure_verifies_whole_report() {
    let report = "P0: panic in parse_header\nP1: leak in cache";
    let agents = Arc::new(
        ScriptedAgents::default()
            .review_report(report)
            .reply(&["VERDICT"], Ok(CONFIRMED)),
    );
    // The pre-filter answers; the splitter call then fails.
    let llm = Arc::new(ScriptedCompletion::with_replies(&[r#"{"has_issue": true}"#]));
    let runner = ReviewRunner::new(llm.clone(), agents.clone(), options(true)).unwrap();

    let result = runner.run().await.unwrap();

    assert_eq!(llm.request_count(), 2);
    assert_eq!(result.status, ReviewStatus::IssuesFound);
    assert_eq!(result.issues.len(), 1);
    assert_eq!(result.issues[0].issue_text, report);
    assert_eq!(result.issues[0].status, IssueStatus::Confirmed);
    assert_eq!(agents.calls_matching("Role: ").len(), 2);
}

#[tokio::test]
async fn test_issue_rejected_in_round_two_is_dropped() {
    let agents = Arc::new(
        ScriptedAgents::default()
            .review_report("P0: panic in parse_header")
            .reply(&["Round 2", "Role: REVIEWER"], Ok(REJECTED))
            .reply(&["Role: REVIEWER"], Ok(CONFIRMED))
            .reply(&["Role: TESTER"], Ok(REJECTED)),
    );
    let llm = Arc::new(ScriptedCompletion::with_replies(&[
        r#"{"has_issue": true}"#,
        r#"{"issues": [{"text": "P0: panic in parse_header"}]}"#,
    ]));
    let runner = ReviewRunner::new(llm, agents.clone(), options(true)).unwrap();

    let result = runner.run().await.unwrap();

    assert_eq!(result.status, ReviewStatus::Clean);
    assert!(result.issues.is_empty());
    assert!(result.summary_branch_id.is_none());
    assert_eq!(agents.calls_matching("Round 2: Exchange").len(), 2);
    assert!(result.review_statistics.unwrap().issue_statistics.is_empty());
}

#[tokio::test]
async fn test_invalid_options_rejected() {
    let agents = Arc::new(ScriptedAgents::default());
    let llm = Arc::new(ScriptedCompletion::default());
    let mut opts = options(true);
    opts.parent_branch_id = " ".into();

    let err = ReviewRunner::new(llm, agents, opts).err().unwrap();
    assert!(matches!(err, VerificationError::InvalidOptions(_)));
}
