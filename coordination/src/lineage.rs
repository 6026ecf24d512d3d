//! Branch lineage tracking for a single run.
//!
//! `start` is the first branch ever recorded, `latest` the most recent one.
//! Only branches observed in a terminal-success state are recorded, so
//! `latest` never points at a branch that errored or timed out.

use serde::{Deserialize, Serialize};

/// Snapshot of the lineage, as attached to reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_branch_id: Option<String>,
}

/// Start/latest branch pair for one run.
#[derive(Debug, Clone, Default)]
pub struct BranchLineage {
    start: Option<String>,
    latest: Option<String>,
}

impl BranchLineage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully completed branch. Empty ids are ignored.
    pub fn record(&mut self, branch_id: &str) {
        let branch_id = branch_id.trim();
        if branch_id.is_empty() {
            return;
        }
        if self.start.is_none() {
            self.start = Some(branch_id.to_string());
        }
        self.latest = Some(branch_id.to_string());
    }

    pub fn start(&self) -> Option<&str> {
        self.start.as_deref()
    }

    pub fn latest(&self) -> Option<&str> {
        self.latest.as_deref()
    }

    pub fn range(&self) -> BranchRange {
        BranchRange {
            start_branch_id: self.start.clone(),
            latest_branch_id: self.latest.clone(),
        }
    }
}
