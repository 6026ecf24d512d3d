//! Prompts of the review pipeline: scout, issue finder, the two verifying
//! roles, their exchange rounds and the JSON-only helper calls.

use std::fmt::Write as _;

use super::state::VerifierRole;

pub const HAS_ISSUE_SYSTEM: &str = "Analyze code review reports. Reply only with JSON.";
pub const ISSUE_SPLITTER_SYSTEM: &str =
    "Parse code review reports and extract individual P0/P1 issues. Reply only with JSON.";

/// Scout: summarise the change set into `analysis_path` for later stages.
pub fn scout_prompt(task: &str, analysis_path: &str) -> String {
    format!(
        "You are the scout for a pull-request review.\n\n\
         Task: {task}\n\n\
         Inspect the change set against its base branch and write a concise change analysis to {analysis_path}.\n\
         Cover: files touched, intent of each change, risky areas (concurrency, error handling, data migrations, public APIs), and how to build and run the relevant tests.\n\
         Do not review or fix anything; only describe. The file must not be empty.\n",
        task = task.trim(),
    )
}

/// The raw review pass run through `review_code`.
pub fn issue_finder_prompt(task: &str, analysis_path: Option<&str>) -> String {
    let mut prompt = format!("Task: {}\n\n", task.trim());
    prompt.push_str("Review the code changes against the base branch.\n");
    prompt.push_str("1. Find the base: git merge-base HEAD BASE_BRANCH\n");
    prompt.push_str("2. Inspect the change: git diff MERGE_BASE_SHA\n");
    if let Some(path) = analysis_path.filter(|p| !p.trim().is_empty()) {
        let _ = writeln!(prompt, "3. A scout wrote a change analysis to {path}; read it first.");
    }
    prompt.push_str(
        "\nOnly report blocking P0/P1 defects: crashes, data loss, security holes, broken behavior.\n\
         Provide prioritized, actionable findings. For each: priority, location, problem, impact, and reproduction idea.\n\
         If nothing blocking exists, say exactly: No P0/P1 issues found.\n",
    );
    prompt
}

/// What both verifying roles are told about the issue.
#[derive(Debug, Clone, Copy)]
pub struct IssueContext<'a> {
    pub task: &'a str,
    pub issue: &'a str,
    /// Scout output, when the scout stage produced one.
    pub analysis_path: Option<&'a str>,
}

impl IssueContext<'_> {
    fn render(&self) -> String {
        let mut out = format!(
            "Task / PR context:\n{}\n\nIssue under review:\n{}\n",
            self.task.trim(),
            self.issue.trim()
        );
        if let Some(path) = self.analysis_path.filter(|p| !p.trim().is_empty()) {
            let _ = writeln!(out, "\nChange analysis: {path} (read it before answering)");
        }
        out
    }
}

/// Static-analysis role. Never claims to have executed anything.
pub fn reviewer_prompt(ctx: &IssueContext<'_>) -> String {
    format!(
        "Role: REVIEWER\n\n\
         Simulate a group of senior programmers reviewing this code change.\n\n\
         {context}\n\
         Their task:\n\
         - Analyze the code logic for correctness.\n\
         - Check edge cases and error-handling regressions.\n\
         - Understand the architectural intent (Chesterton's Fence) before calling something a bug.\n\
         - Identify design issues and safety hazards.\n\n\
         Evidence standards:\n\
         + Actual code paths, control flow, concrete inputs and outputs.\n\
         + Git history or docs that prove intent.\n\
         - Not accepted: fabricated mocks, \"should\" statements, gut feelings.\n\n\
         You only read code. Do NOT claim you ran tests or commands.\n\n\
         Response format (first line):\n\
         # VERDICT: CONFIRMED | REJECTED\n\
         Then: Issue Location, Problem Summary, Root Cause, Impact, Suggested Fix (or Architectural Intent and Evidence for REJECTED).\n",
        context = ctx.render(),
    )
}

/// Execution role. Must reproduce with real commands.
pub fn tester_prompt(ctx: &IssueContext<'_>) -> String {
    format!(
        "Role: TESTER\n\n\
         Simulate a QA engineer who reproduces issues by running code.\n\n\
         {context}\n\
         Their task:\n\
         - You MUST actually run code: reproduce, write and run a minimal failing test or command sequence.\n\
         - Trace real execution paths and capture stack traces or logs.\n\
         - Do NOT fabricate output; only report what the commands printed.\n\n\
         Response format (first line):\n\
         # VERDICT: CONFIRMED (with test evidence) | REJECTED (could not reproduce)\n\
         Then include the key command or code snippet you ran, the observed output, and why it proves or disproves the issue.\n",
        context = ctx.render(),
    )
}

/// Opening prompt of `role` for round 1.
pub fn initial_prompt(role: VerifierRole, ctx: &IssueContext<'_>) -> String {
    match role {
        VerifierRole::Reviewer => reviewer_prompt(ctx),
        VerifierRole::Verifier => tester_prompt(ctx),
    }
}

/// How a transcript is quoted to the other role.
pub fn peer_opinion(verdict: &str, reason: &str, analysis: &str) -> String {
    format!("Peer Verdict: {}\nReason: {}\nAnalysis: {}", verdict, reason, analysis.trim())
}

/// Exchange round: the role sees its own previous answer and the peer's.
pub fn exchange_prompt(role: VerifierRole, round: u32, ctx: &IssueContext<'_>, own: &str, peer: &str) -> String {
    let (label, guidance) = match role {
        VerifierRole::Reviewer => (
            "REVIEWER",
            "- Stay with logic analysis: code paths, invariants, intent.\n\
             - Do NOT claim you ran tests or commands.\n",
        ),
        VerifierRole::Verifier => (
            "TESTER",
            "- run code to settle the disagreement; re-run your reproduction if needed.\n\
             - Only real execution evidence counts; never invent output.\n",
        ),
    };
    format!(
        "Round {round}: Exchange Opinions.\n\
         Role: {label}\n\n\
         {context}\n\
         YOUR PREVIOUS OPINION:\n{own}\n\n\
         PEER'S OPINION:\n<<<PEER_OPINION>>>\n{peer}\n<<<END_PEER_OPINION>>>\n\n\
         Instructions:\n\
         - Identify where the peer's reasoning strengthens or weakens your position.\n\
         {guidance}\
         - If evidence stays inconclusive, reject: when in doubt, do not report.\n\n\
         Response format (first line):\n\
         # VERDICT: CONFIRMED | REJECTED\n\
         Then explain how the peer's opinion changed or reinforced your conclusion.\n",
        context = ctx.render(),
        own = own.trim(),
        peer = peer.trim(),
    )
}

pub fn has_issue_prompt(report: &str) -> String {
    format!(
        "Below is a code review report.\n\n\
         Decide whether it reports at least one real, blocking P0/P1 defect. \
         Reports that only contain style nits, questions, or say no P0/P1 issues were found do not count.\n\n\
         Reply with JSON only: {{\"has_issue\": true}} or {{\"has_issue\": false}}\n\n\
         REPORT:\n{}\n",
        report.trim()
    )
}

pub fn issue_splitter_prompt(report: &str) -> String {
    format!(
        "Split the code review report below into its individual P0/P1 issues.\n\
         Each issue text must be self-contained: location, problem, impact.\n\
         Ignore anything below P1.\n\n\
         Reply with JSON only:\n\
         {{\"issues\": [{{\"text\": \"...\", \"priority\": \"P0\"}}]}}\n\
         Return {{\"issues\": []}} when the report has no P0/P1 issue.\n\n\
         REPORT:\n{}\n",
        report.trim()
    )
}

/// Final human-readable write-up of a review run.
pub fn summary_report_prompt(task: &str, result_json: &str, report_path: &str) -> String {
    format!(
        "Write the final review summary for this pull request to {report_path}.\n\n\
         Task: {task}\n\n\
         Verification result (JSON):\n{result_json}\n\n\
         Rules:\n\
         - List confirmed issues first with location, impact and suggested fix.\n\
         - List unresolved issues separately and say they were not reproduced by both roles.\n\
         - Do not add issues that are not in the result.\n\
         - Markdown only; keep it short.\n",
        task = task.trim(),
    )
}
