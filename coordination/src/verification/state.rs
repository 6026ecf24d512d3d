//! Results of the review pipeline and its per-issue verification.

use serde::{Deserialize, Serialize};

use super::stats::ReviewStatistics;
use super::verdict::{Verdict, VerdictDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierRole {
    /// Static logic analysis; never executes code.
    Reviewer,
    /// Must run code and report real evidence.
    Verifier,
}

impl VerifierRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reviewer => "reviewer",
            Self::Verifier => "verifier",
        }
    }

    pub fn step_name(self, round: u32) -> String {
        format!("{}_round{}", self.as_str(), round)
    }
}

impl std::fmt::Display for VerifierRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One role's answer in one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub role: VerifierRole,
    pub round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    pub text: String,
    pub verdict: Verdict,
    pub verdict_reason: String,
}

impl Transcript {
    pub fn new(role: VerifierRole, round: u32, branch_id: Option<String>, text: String, decision: VerdictDecision) -> Self {
        Self {
            role,
            round,
            branch_id,
            text,
            verdict: decision.verdict,
            verdict_reason: decision.reason,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Confirmed,
    Unresolved,
}

/// How the two roles ended up relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consensus {
    BothConfirmed,
    BothRejected,
    Split,
}

impl Consensus {
    pub fn of(reviewer: Verdict, verifier: Verdict) -> Self {
        match (reviewer, verifier) {
            (Verdict::Confirmed, Verdict::Confirmed) => Self::BothConfirmed,
            (Verdict::Rejected, Verdict::Rejected) => Self::BothRejected,
            _ => Self::Split,
        }
    }

    /// Only joint confirmation promotes an issue.
    pub fn status(self) -> IssueStatus {
        match self {
            Self::BothConfirmed => IssueStatus::Confirmed,
            Self::BothRejected | Self::Split => IssueStatus::Unresolved,
        }
    }
}

/// Branches produced in one round; a role that reused its earlier transcript
/// has no entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundBranches {
    pub round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier_branch_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueReport {
    pub issue_text: String,
    pub status: IssueStatus,
    /// Absent when the verifier never produced a transcript.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<Consensus>,
    pub reviewer: Transcript,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier: Option<Transcript>,
    pub round_branches: Vec<RoundBranches>,
    /// Rounds after the first: 0, 1 or 2.
    pub exchange_rounds: u32,
    pub verdict_explanation: String,
}

impl IssueReport {
    /// Both roles rejected: the issue is not reported at all.
    pub fn is_dismissed(&self) -> bool {
        self.consensus == Some(Consensus::BothRejected)
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == IssueStatus::Confirmed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Clean,
    IssuesFound,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::IssuesFound => "issues_found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewerLog {
    pub branch_id: String,
    pub report: String,
}

/// Result of one review run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub task: String,
    pub status: ReviewStatus,
    pub summary: String,
    pub reviewer_logs: Vec<ReviewerLog>,
    pub issues: Vec<IssueReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_statistics: Option<ReviewStatistics>,
}

pub const CLEAN_SUMMARY: &str = "Clean PR: Not found any blocking P0/P1 issues.";

impl ReviewResult {
    pub fn clean(task: &str, reviewer_logs: Vec<ReviewerLog>) -> Self {
        Self {
            task: task.to_string(),
            status: ReviewStatus::Clean,
            summary: CLEAN_SUMMARY.to_string(),
            reviewer_logs,
            issues: Vec::new(),
            start_branch_id: None,
            latest_branch_id: None,
            summary_branch_id: None,
            review_statistics: None,
        }
    }

    /// Outcome for the surviving issue set; an empty set is clean.
    pub fn with_issues(task: &str, reviewer_logs: Vec<ReviewerLog>, issues: Vec<IssueReport>) -> Self {
        if issues.is_empty() {
            return Self::clean(task, reviewer_logs);
        }
        let confirmed = issues.iter().filter(|i| i.is_confirmed()).count();
        let summary = format!(
            "Identified {} P0/P1 issues ({} confirmed, {} unresolved).",
            issues.len(),
            confirmed,
            issues.len() - confirmed
        );
        Self {
            status: ReviewStatus::IssuesFound,
            summary,
            issues,
            ..Self::clean(task, reviewer_logs)
        }
    }

    pub fn confirmed_count(&self) -> usize {
        self.issues.iter().filter(|i| i.is_confirmed()).count()
    }
}
