//! Deterministic verdict extraction from agent transcripts.
//!
//! Agents must open their answer with a marker line such as
//! `# VERDICT: CONFIRMED`. No LLM is consulted: a transcript without a
//! readable marker counts as rejected.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Non-quoted, non-blank lines inspected for a marker.
pub const VERDICT_SCAN_LINES: usize = 10;

pub const MISSING_MARKER_REASON: &str = "missing explicit transcript verdict marker";

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#+\s*)?\**\s*verdict\s*\**\s*:\s*\**\s*(.*?)\s*\**\s*$")
        .expect("verdict marker regex should compile")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Confirmed,
    Rejected,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }

    fn canonical(self) -> &'static str {
        match self {
            Self::Confirmed => "CONFIRMED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verdict plus why it was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictDecision {
    pub verdict: Verdict,
    pub reason: String,
}

/// Find an explicit verdict marker in the first [`VERDICT_SCAN_LINES`]
/// non-quoted lines.
///
/// Lines starting with `>` are quotes of someone else's text and are skipped.
/// A line that echoes the prompt template (`CONFIRMED | REJECTED`) is
/// ignored.
pub fn extract_transcript_verdict(text: &str) -> Option<VerdictDecision> {
    let lines = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('>'))
        .take(VERDICT_SCAN_LINES);

    for line in lines {
        let Some(captures) = MARKER.captures(line) else {
            continue;
        };
        let value = captures.get(1).map_or("", |m| m.as_str()).trim().to_uppercase();
        if is_prompt_echo(&value) {
            continue;
        }
        let value = strip_brackets(&value);
        for verdict in [Verdict::Confirmed, Verdict::Rejected] {
            if matches_qualified(value, verdict.canonical()) {
                return Some(VerdictDecision {
                    verdict,
                    reason: format!("explicit transcript verdict marker: {}", value),
                });
            }
        }
    }
    None
}

/// [`extract_transcript_verdict`], falling back to a rejection.
pub fn determine_verdict(text: &str) -> VerdictDecision {
    extract_transcript_verdict(text).unwrap_or_else(|| VerdictDecision {
        verdict: Verdict::Rejected,
        reason: MISSING_MARKER_REASON.to_string(),
    })
}

fn is_prompt_echo(value: &str) -> bool {
    value.contains('|') && value.contains("CONFIRMED") && value.contains("REJECTED")
}

/// `[CONFIRMED]` → `CONFIRMED`; the qualifier after the bracket is kept.
fn strip_brackets(value: &str) -> &str {
    match value.strip_prefix('[') {
        Some(rest) => match rest.find(']') {
            Some(end) if rest[end + 1..].trim().is_empty() => rest[..end].trim(),
            _ => value,
        },
        None => value,
    }
}

/// `CONFIRMED`, `CONFIRMED (with test evidence)`, `CONFIRMED - reproduced`.
fn matches_qualified(value: &str, canonical: &str) -> bool {
    let Some(rest) = value.strip_prefix(canonical) else {
        return false;
    };
    let rest = rest.trim();
    if rest.is_empty() {
        return true;
    }
    if let Some(inner) = rest.strip_prefix('(') {
        return inner
            .strip_suffix(')')
            .is_some_and(|inner| !inner.trim().is_empty());
    }
    match rest.strip_prefix('-').or_else(|| rest.strip_prefix(':')) {
        Some(tail) => !tail.trim().is_empty(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heading_marker_confirmed() {
        let decision = extract_transcript_verdict("# VERDICT: CONFIRMED\n\n## Reasoning\nok").unwrap();
        assert_eq!(decision.verdict, Verdict::Confirmed);
        assert!(!decision.reason.is_empty());
    }

    #[test]
    fn test_marker_variants() {
        let cases = [
            ("   # verdict: rejected\nDetails...", Verdict::Rejected),
            ("# VERDICT: [CONFIRMED]\nEvidence", Verdict::Confirmed),
            ("**VERDICT:** REJECTED", Verdict::Rejected),
            ("## Verdict: Confirmed (with test evidence)", Verdict::Confirmed),
            ("VERDICT: REJECTED - could not reproduce", Verdict::Rejected),
        ];
        for (text, expected) in cases {
            assert_eq!(
                extract_transcript_verdict(text).map(|d| d.verdict),
                Some(expected),
                "{text}"
            );
        }
    }

    #[test]
    fn test_quoted_and_missing_markers() {
        assert!(extract_transcript_verdict("> # VERDICT: CONFIRMED\n\nNo explicit marker here").is_none());
        assert!(extract_transcript_verdict("I think this is a bug but forgot the header").is_none());
        assert!(extract_transcript_verdict("# VERDICT: MAYBE").is_none());
        assert!(extract_transcript_verdict("# VERDICT: CONFIRMED (").is_none());
        assert!(extract_transcript_verdict("# VERDICT: CONFIRMED -").is_none());
    }

    #[test]
    fn test_prompt_echo_skipped() {
        let text = "# VERDICT: CONFIRMED | REJECTED\n# VERDICT: REJECTED\nbecause";
        assert_eq!(extract_transcript_verdict(text).unwrap().verdict, Verdict::Rejected);
    }

    #[test]
    fn test_marker_beyond_scan_window_ignored() {
        let mut text: String = (0..VERDICT_SCAN_LINES).map(|i| format!("line {i}\n")).collect();
        text.push_str("# VERDICT: CONFIRMED\n");
        let decision = determine_verdict(&text);
        assert_eq!(decision.verdict, Verdict::Rejected);
        assert_eq!(decision.reason, MISSING_MARKER_REASON);
    }

    #[test]
    fn test_blank_lines_do_not_count() {
        let text = format!("{}# VERDICT: CONFIRMED", "\n".repeat(40));
        assert_eq!(determine_verdict(&text).verdict, Verdict::Confirmed);
    }
}
