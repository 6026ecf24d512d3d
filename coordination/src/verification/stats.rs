//! Step timings and per-issue round counts of a review run.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::state::IssueReport;

pub const ABNORMAL_ISSUE: &str = "Error or unusual behavior";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTiming {
    pub step_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbnormalStep {
    pub step_name: String,
    pub issue: String,
    pub description: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueStatistic {
    pub issue_text: String,
    pub steps: u32,
    pub duration: String,
    pub reviewer_rounds: u32,
    pub verifier_rounds: u32,
}

impl IssueStatistic {
    pub fn from_report(report: &IssueReport, elapsed: Duration) -> Self {
        let reviewer_rounds = report.exchange_rounds + 1;
        let verifier_rounds = if report.verifier.as_ref().is_some_and(|v| v.branch_id.is_some()) {
            report.exchange_rounds + 1
        } else {
            0
        };
        Self {
            issue_text: report.issue_text.clone(),
            steps: reviewer_rounds + verifier_rounds,
            duration: format_duration(elapsed),
            reviewer_rounds,
            verifier_rounds,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewStatistics {
    pub total_steps: u32,
    pub abnormal_steps: Vec<AbnormalStep>,
    pub step_timings: Vec<StepTiming>,
    pub total_duration: String,
    /// Keyed by issue text.
    pub issue_statistics: BTreeMap<String, IssueStatistic>,
}

/// Collects [`ReviewStatistics`] from concurrently verified issues.
#[derive(Debug)]
pub struct StatsRecorder {
    started: Instant,
    inner: Mutex<ReviewStatistics>,
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            inner: Mutex::new(ReviewStatistics::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ReviewStatistics> {
        // Every update is a single push or insert; a poisoned lock still holds valid data.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a timing for `step_name`; pass the returned instant to [`end_step`](Self::end_step).
    pub fn start_step(&self, step_name: &str) -> Instant {
        let mut state = self.state();
        state.total_steps += 1;
        state.step_timings.push(StepTiming {
            step_name: step_name.to_string(),
            duration: None,
            start_time: now_rfc3339(),
            end_time: None,
        });
        Instant::now()
    }

    /// Close the most recent open timing named `step_name`.
    pub fn end_step(&self, step_name: &str, started: Instant) {
        let elapsed = started.elapsed();
        let mut state = self.state();
        let open = state
            .step_timings
            .iter_mut()
            .rev()
            .find(|t| t.step_name == step_name && t.end_time.is_none());
        match open {
            Some(timing) => {
                timing.duration = Some(format_duration(elapsed));
                timing.end_time = Some(now_rfc3339());
            }
            None => warn!(step = step_name, "No open timing for finished step"),
        }
    }

    pub fn record_abnormal(&self, step_name: &str, description: impl Into<String>) {
        self.state().abnormal_steps.push(AbnormalStep {
            step_name: step_name.to_string(),
            issue: ABNORMAL_ISSUE.to_string(),
            description: description.into(),
            timestamp: now_rfc3339(),
        });
    }

    pub fn record_issue(&self, report: &IssueReport, elapsed: Duration) {
        let stat = IssueStatistic::from_report(report, elapsed);
        self.state().issue_statistics.insert(stat.issue_text.clone(), stat);
    }

    /// Copy of the collected statistics with the run duration filled in.
    pub fn finish(&self) -> ReviewStatistics {
        let mut snapshot = self.state().clone();
        snapshot.total_duration = format_duration(self.started.elapsed());
        snapshot
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn format_duration(elapsed: Duration) -> String {
    format!("{:.3}s", elapsed.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::state::{Consensus, IssueStatus, Transcript, VerifierRole};
    use crate::verification::verdict::{Verdict, VerdictDecision};

    fn transcript(role: VerifierRole, branch: Option<&str>) -> Transcript {
        Transcript::new(
            role,
            1,
            branch.map(String::from),
            String::new(),
            VerdictDecision {
                verdict: Verdict::Rejected,
                reason: "r".into(),
            },
        )
    }

    #[test]
    fn test_step_timing_closes_latest_open_entry() {
        let stats = StatsRecorder::new();
        let first = stats.start_step("review");
        stats.end_step("review", first);
        let second = stats.start_step("review");
        stats.end_step("review", second);
        stats.start_step("scout");

        let out = stats.finish();
        assert_eq!(out.total_steps, 3);
        assert!(out.step_timings[0].end_time.is_some());
        assert!(out.step_timings[1].duration.is_some());
        assert!(out.step_timings[2].end_time.is_none());
        assert!(out.total_duration.ends_with('s'));
    }

    #[test]
    fn test_abnormal_step_recorded() {
        let stats = StatsRecorder::new();
        stats.record_abnormal("scout", "scout wrote empty analysis file");
        let out = stats.finish();
        assert_eq!(out.abnormal_steps.len(), 1);
        assert_eq!(out.abnormal_steps[0].issue, ABNORMAL_ISSUE);
        assert_eq!(out.abnormal_steps[0].step_name, "scout");
    }

    #[test]
    fn test_issue_rounds_without_verifier_branch() {
        let mut report = IssueReport {
            issue_text: "P1: leak".into(),
            status: IssueStatus::Unresolved,
            consensus: None,
            reviewer: transcript(VerifierRole::Reviewer, Some("r1")),
            verifier: None,
            round_branches: vec![],
            exchange_rounds: 0,
            verdict_explanation: String::new(),
        };
        let stat = IssueStatistic::from_report(&report, Duration::from_millis(1500));
        assert_eq!((stat.reviewer_rounds, stat.verifier_rounds, stat.steps), (1, 0, 1));
        assert_eq!(stat.duration, "1.500s");

        report.consensus = Some(Consensus::Split);
        report.verifier = Some(transcript(VerifierRole::Verifier, Some("v3")));
        report.exchange_rounds = 2;
        let stat = IssueStatistic::from_report(&report, Duration::ZERO);
        assert_eq!((stat.reviewer_rounds, stat.verifier_rounds, stat.steps), (3, 3, 6));
    }
}
