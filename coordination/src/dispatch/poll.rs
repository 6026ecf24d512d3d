//! Adaptive status polling: backoff schedule, status parsing, terminal detection.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::control_plane::extract_branch_id;

/// Default first sleep between status polls.
pub const DEFAULT_POLL_INITIAL: Duration = Duration::from_secs(5);
/// Default cap on the sleep between polls.
pub const DEFAULT_POLL_MAX: Duration = Duration::from_secs(600);
/// Default multiplier applied after each non-terminal observation.
pub const DEFAULT_POLL_BACKOFF: f64 = 1.5;
/// Default overall deadline. Remote branches routinely run 1-2 hours.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);

/// Stand-in deadline when `timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Statuses that end polling successfully.
pub const SUCCESS_STATUSES: [&str; 4] = ["succeed", "ready_for_manifest", "finished", "manifesting"];
/// Status that ends polling with a failure.
pub const FAILED_STATUS: &str = "failed";

/// Polling parameters for one dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub initial: Duration,
    pub max: Duration,
    pub backoff: f64,
    pub timeout: Duration,
    /// Defer completion until the branch has a snapshot distinct from its
    /// parent's. Off by default.
    pub require_new_snapshot: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_POLL_INITIAL,
            max: DEFAULT_POLL_MAX,
            backoff: DEFAULT_POLL_BACKOFF,
            timeout: DEFAULT_POLL_TIMEOUT,
            require_new_snapshot: false,
        }
    }
}

impl PollConfig {
    /// Build a config, replacing invalid values with defaults.
    ///
    /// Zero durations fall back to the defaults, a backoff factor `<= 1.0`
    /// falls back to 1.5 and `max` is raised to `initial` when smaller.
    pub fn new(initial: Duration, max: Duration, backoff: f64, timeout: Duration) -> Self {
        Self {
            initial: non_zero_or(initial, DEFAULT_POLL_INITIAL),
            max: non_zero_or(max, DEFAULT_POLL_MAX),
            backoff: if backoff > 1.0 { backoff } else { DEFAULT_POLL_BACKOFF },
            timeout: non_zero_or(timeout, DEFAULT_POLL_TIMEOUT),
            require_new_snapshot: false,
        }
        .normalized()
    }

    pub fn with_snapshot_guard(mut self, enabled: bool) -> Self {
        self.require_new_snapshot = enabled;
        self
    }

    /// When polling started at `start` gives up; saturates on huge timeouts.
    pub fn deadline_from(&self, start: Instant) -> Instant {
        start
            .checked_add(self.timeout)
            .or_else(|| start.checked_add(FAR_FUTURE))
            .unwrap_or(start)
    }

    fn normalized(mut self) -> Self {
        if self.max < self.initial {
            self.max = self.initial;
        }
        self
    }
}

fn non_zero_or(value: Duration, fallback: Duration) -> Duration {
    if value.is_zero() {
        fallback
    } else {
        value
    }
}

/// Geometric sleep schedule capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    factor: f64,
}

impl Backoff {
    pub fn new(config: &PollConfig) -> Self {
        let config = config.clone().normalized();
        Self {
            current: config.initial,
            max: config.max,
            factor: config.backoff,
        }
    }

    /// The sleep to take now; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = self.current.as_secs_f64() * self.factor;
        self.current = Duration::try_from_secs_f64(grown).map_or(self.max, |next| next.min(self.max));
        delay
    }
}

/// Coarse lifecycle phase derived from a status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchPhase {
    Running,
    Succeeded,
    Failed,
}

/// Typed view of a status payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchStatus {
    pub branch_id: String,
    /// Lower-cased, trimmed status.
    pub status: String,
    pub status_text: Option<String>,
    pub parent_id: Option<String>,
    pub latest_snap_id: Option<String>,
    output: Option<String>,
}

impl BranchStatus {
    /// Parse a status payload. Fails when the payload reports an error or has
    /// no branch identifier.
    pub fn from_payload(payload: &Value) -> Result<Self, String> {
        if let Some(err) = payload.get("error").filter(|e| !e.is_null()) {
            return Err(format!("returned error: {err}"));
        }
        let branch_id = extract_branch_id(payload)
            .ok_or_else(|| format!("response missing branch identifier: {payload}"))?;

        Ok(Self {
            branch_id,
            status: str_field(payload, "status")
                .map(|s| s.to_lowercase())
                .unwrap_or_default(),
            status_text: str_field(payload, "status_text")
                .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" ")),
            parent_id: str_field(payload, "parent_id"),
            latest_snap_id: str_field(payload, "latest_snap_id").map(|s| s.to_lowercase()),
            output: payload_output(payload),
        })
    }

    pub fn phase(&self) -> BranchPhase {
        if self.status == FAILED_STATUS {
            BranchPhase::Failed
        } else if SUCCESS_STATUSES.contains(&self.status.as_str()) {
            BranchPhase::Succeeded
        } else {
            BranchPhase::Running
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase() != BranchPhase::Running
    }

    /// Text carried by the status payload itself, used when the output
    /// endpoint returns nothing.
    pub fn fallback_output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    /// Display status, `unknown` when blank.
    pub fn status_label(&self) -> &str {
        if self.status.is_empty() {
            "unknown"
        } else {
            &self.status
        }
    }
}

fn str_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn payload_output(payload: &Value) -> Option<String> {
    str_field(payload, "output")
        .or_else(|| payload.get("latest_snap").and_then(|snap| str_field(snap, "output")))
        .or_else(|| payload.get("manifest").and_then(|m| str_field(m, "summary")))
}
