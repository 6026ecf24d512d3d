//! Verification consensus engine and the PR review pipeline around it.
//!
//! A raw review is filtered, split into issues and each issue is judged by
//! two independent roles: a reviewer that reads code and a verifier that runs
//! it. An issue is confirmed only when both say so; anything else is
//! reported as unresolved or, when both reject it, dropped.

pub mod consensus;
pub mod pipeline;
pub mod prompts;
pub mod state;
pub mod stats;
pub mod steps;
pub mod verdict;

use thiserror::Error;

use crate::completion::CompletionError;
use crate::error::ToolExecutionError;

pub use consensus::{IssueVerifier, MAX_ROUNDS};
pub use pipeline::{ReviewOptions, ReviewRunner, CHANGE_ANALYSIS_FILE, SUMMARY_REPORT_FILE};
pub use state::{
    Consensus, IssueReport, IssueStatus, ReviewResult, ReviewStatus, ReviewerLog, RoundBranches, Transcript,
    VerifierRole, CLEAN_SUMMARY,
};
pub use stats::{ReviewStatistics, StatsRecorder};
pub use steps::{StepRunner, WORKER_AGENT};
pub use verdict::{determine_verdict, extract_transcript_verdict, Verdict, VerdictDecision};

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("invalid review options: {0}")]
    InvalidOptions(String),

    #[error("{role} round {round} failed: {source}")]
    Agent {
        role: VerifierRole,
        round: u32,
        #[source]
        source: ToolExecutionError,
    },

    #[error("{step} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: ToolExecutionError,
    },

    #[error("review_code did not include code_review.log contents")]
    EmptyReview,

    #[error("failed to parse has_issue JSON: {0}")]
    PreFilter(String),

    #[error(transparent)]
    Completion(#[from] CompletionError),
}
