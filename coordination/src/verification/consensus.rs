//! Two-role consensus over a single issue.
//!
//! Round 1 runs the reviewer and the verifier in parallel from the same
//! branch. While their verdicts differ, each role re-runs from its own last
//! branch with the other's answer as a peer opinion, for at most
//! [`MAX_ROUNDS`] rounds in total.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use super::prompts::{exchange_prompt, initial_prompt, peer_opinion, IssueContext};
use super::state::{Consensus, IssueReport, IssueStatus, RoundBranches, Transcript, VerifierRole};
use super::stats::StatsRecorder;
use super::steps::{StepRunner, WORKER_AGENT};
use super::verdict::determine_verdict;
use super::VerificationError;
use crate::error::ToolExecutionError;

pub const MAX_ROUNDS: u32 = 3;

pub struct IssueVerifier {
    steps: StepRunner,
    stats: Arc<StatsRecorder>,
    task: String,
    analysis_path: Option<String>,
}

impl IssueVerifier {
    pub fn new(steps: StepRunner, stats: Arc<StatsRecorder>, task: impl Into<String>) -> Self {
        Self {
            steps,
            stats,
            task: task.into(),
            analysis_path: None,
        }
    }

    pub fn with_analysis_path(mut self, path: Option<String>) -> Self {
        self.analysis_path = path;
        self
    }

    /// Verify `issue_text` starting from `start_branch_id`.
    ///
    /// Only a round-1 reviewer failure is an error; every other failure is
    /// folded into the report. Dismissed issues get no issue statistics.
    pub async fn verify(&self, issue_text: &str, start_branch_id: &str) -> Result<IssueReport, VerificationError> {
        let started = Instant::now();
        let report = self.run_rounds(issue_text, start_branch_id).await?;
        if !report.is_dismissed() {
            self.stats.record_issue(&report, started.elapsed());
        }
        info!(
            status = ?report.status,
            consensus = ?report.consensus,
            exchange_rounds = report.exchange_rounds,
            "Issue verification finished"
        );
        Ok(report)
    }

    async fn run_rounds(&self, issue_text: &str, start_branch_id: &str) -> Result<IssueReport, VerificationError> {
        let ctx = IssueContext {
            task: &self.task,
            issue: issue_text,
            analysis_path: self.analysis_path.as_deref(),
        };

        let (reviewer, verifier) = tokio::join!(
            self.run_role(VerifierRole::Reviewer, 1, initial_prompt(VerifierRole::Reviewer, &ctx), start_branch_id),
            self.run_role(VerifierRole::Verifier, 1, initial_prompt(VerifierRole::Verifier, &ctx), start_branch_id),
        );
        let mut reviewer = reviewer.map_err(|source| VerificationError::Agent {
            role: VerifierRole::Reviewer,
            round: 1,
            source,
        })?;
        let mut round_branches = vec![RoundBranches {
            round: 1,
            reviewer_branch_id: reviewer.branch_id.clone(),
            verifier_branch_id: verifier.as_ref().ok().and_then(|t| t.branch_id.clone()),
        }];

        let mut verifier = match verifier {
            Ok(transcript) => transcript,
            Err(err) => {
                let verdict_explanation = format!(
                    "Round 1: Reviewer {} but verifier failed: {}",
                    reviewer.verdict, err.message
                );
                return Ok(IssueReport {
                    issue_text: issue_text.trim().to_string(),
                    status: IssueStatus::Unresolved,
                    consensus: None,
                    reviewer,
                    verifier: None,
                    round_branches,
                    exchange_rounds: 0,
                    verdict_explanation,
                });
            }
        };

        let mut round = 1;
        while reviewer.verdict != verifier.verdict && round < MAX_ROUNDS {
            round += 1;
            let mut branches = RoundBranches {
                round,
                reviewer_branch_id: None,
                verifier_branch_id: None,
            };

            let peer = peer_opinion(verifier.verdict.as_str(), &verifier.verdict_reason, &verifier.text);
            let prompt = exchange_prompt(VerifierRole::Reviewer, round, &ctx, &reviewer.text, &peer);
            let parent = continuation_parent(&reviewer, start_branch_id);
            if let Ok(next) = self.run_role(VerifierRole::Reviewer, round, prompt, &parent).await {
                branches.reviewer_branch_id = next.branch_id.clone();
                reviewer = next;
            }

            let peer = peer_opinion(reviewer.verdict.as_str(), &reviewer.verdict_reason, &reviewer.text);
            let prompt = exchange_prompt(VerifierRole::Verifier, round, &ctx, &verifier.text, &peer);
            let parent = continuation_parent(&verifier, start_branch_id);
            if let Ok(next) = self.run_role(VerifierRole::Verifier, round, prompt, &parent).await {
                branches.verifier_branch_id = next.branch_id.clone();
                verifier = next;
            }

            round_branches.push(branches);
        }

        let consensus = Consensus::of(reviewer.verdict, verifier.verdict);
        let verdict_explanation = match consensus {
            Consensus::Split => format!(
                "After {} rounds: Reviewer {} and verifier {} - still inconsistent (when in doubt, do not report)",
                MAX_ROUNDS, reviewer.verdict, verifier.verdict
            ),
            _ => format!(
                "Round {}: Reviewer {} and verifier {} - consistent",
                round, reviewer.verdict, verifier.verdict
            ),
        };

        Ok(IssueReport {
            issue_text: issue_text.trim().to_string(),
            status: consensus.status(),
            consensus: Some(consensus),
            reviewer,
            verifier: Some(verifier),
            round_branches,
            exchange_rounds: round - 1,
            verdict_explanation,
        })
    }

    /// One role run; failures are logged and recorded as abnormal steps.
    async fn run_role(
        &self,
        role: VerifierRole,
        round: u32,
        prompt: String,
        parent_branch_id: &str,
    ) -> Result<Transcript, ToolExecutionError> {
        let step = role.step_name(round);
        let started = self.stats.start_step(&step);
        let result = self.steps.run(&step, WORKER_AGENT, prompt, parent_branch_id).await;
        self.stats.end_step(&step, started);

        let run = match result {
            Ok(run) => run,
            Err(err) => {
                warn!(%role, round, error = %err, "Verification role failed");
                self.stats
                    .record_abnormal(&step, format!("execute_agent failed: {}", err.message));
                return Err(err);
            }
        };

        let text = run.response.trim().to_string();
        let decision = determine_verdict(&text);
        info!(%role, round, branch_id = %run.branch_id, verdict = %decision.verdict, "Role verdict");
        let branch_id = Some(run.branch_id).filter(|id| !id.trim().is_empty());
        Ok(Transcript::new(role, round, branch_id, text, decision))
    }
}

/// A role continues from its own last branch so its context accumulates.
fn continuation_parent(previous: &Transcript, start_branch_id: &str) -> String {
    previous
        .branch_id
        .clone()
        .unwrap_or_else(|| start_branch_id.to_string())
}
