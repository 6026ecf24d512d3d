//! Prompts of the development loop and its report finalizer.

use serde_json::json;

use crate::completion::ChatMessage;

const SYSTEM_PREAMBLE: &str = "You are an expert software engineer and a workflow orchestrator for remote coding agents.

You control a strict, evidence-first issue/PR resolve loop by launching long-running agent branches via tools.

Hard rule: each assistant response MUST either (a) call exactly ONE tool, or (b) output the FINAL REPORT as JSON (and nothing else).
Hard rule: one issue, one PR. Never create a second PR.
Hard rule: every execute_agent call launches exactly one branch.
Hard rule: no publish step (do not add any final publish stage outside the agent branches).

Tool note: execute_agent returns a response excerpt (may be truncated). If response_truncated=true, use full_output_hint to fetch more via branch_output with tail/max_chars.
";

const OUTPUT_RULE: &str = "Stop by outputting JSON only, with \"finished\": true plus task, status and summary (and pr_url/pr_number/pr_head_branch when a PR exists). Never include any extra text around the JSON.";

const USER_NOTES: &str =
    "Follow the playbook in the system prompt. One tool call per turn. One PR only. No publish step.";

/// System prompt, with the playbook appended when one is supplied.
pub fn system_prompt(playbook: Option<&str>) -> String {
    let mut prompt = String::from(SYSTEM_PREAMBLE);
    if let Some(playbook) = playbook.map(str::trim).filter(|p| !p.is_empty()) {
        prompt.push_str("\n\n=== Playbook (authoritative) ===\n\n");
        prompt.push_str(playbook);
    }
    prompt.push_str("\n\n=== Output rule ===\n\n");
    prompt.push_str(OUTPUT_RULE);
    prompt.push('\n');
    prompt
}

/// Parameters of the opening user message.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub task: String,
    pub parent_branch_id: String,
    pub project_name: String,
    pub workspace_dir: String,
}

/// System prompt plus the pretty-printed run context as the first user turn.
pub fn initial_messages(context: &RunContext, playbook: Option<&str>) -> Vec<ChatMessage> {
    let payload = json!({
        "task": context.task.trim(),
        "parent_branch_id": context.parent_branch_id,
        "project_name": context.project_name,
        "workspace_dir": context.workspace_dir,
        "notes": USER_NOTES,
    });
    let user = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
    vec![ChatMessage::system(system_prompt(playbook)), ChatMessage::user(user)]
}

pub const FINALIZER_SYSTEM: &str = "You are the report finalizer of an automated coding-agent run.

Given an input report, output a CLEAN final JSON report.

Rules:
- Output JSON only. No code fences, no prose.
- Keep the original status semantics; do not invent success/failure.
- Required fields in output: finished=true, status, task, summary, instructions.
- Allowed optional fields (only if present and non-empty): start_branch_id, latest_branch_id, pr_url, pr_number, pr_head_branch, error, instruction.
- Do NOT include any other keys.
- Do NOT include any null/empty fields.

instructions should be actionable next steps. If status is iteration_limit, include rerun guidance using latest_branch_id as --parent-branch-id.";

pub fn finalizer_user(report_json: &str) -> String {
    format!("INPUT_REPORT_JSON:\n{report_json}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Role;

    #[test]
    fn test_system_prompt_sections() {
        let plain = system_prompt(None);
        assert!(plain.contains("exactly ONE tool"));
        assert!(plain.contains("=== Output rule ==="));
        assert!(!plain.contains("Playbook"));

        let with_playbook = system_prompt(Some("1. reproduce\n2. fix"));
        let playbook_at = with_playbook.find("=== Playbook (authoritative) ===").unwrap();
        let rule_at = with_playbook.find("=== Output rule ===").unwrap();
        assert!(playbook_at < rule_at);
        assert!(with_playbook.contains("2. fix"));

        assert_eq!(system_prompt(Some("   ")), plain);
    }

    #[test]
    fn test_initial_messages_payload() {
        let messages = initial_messages(
            &RunContext {
                task: "  fix #7 ".into(),
                parent_branch_id: "b-0".into(),
                project_name: "demo".into(),
                workspace_dir: "/ws".into(),
            },
            None,
        );
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        let payload: serde_json::Value = serde_json::from_str(&messages[1].content).unwrap();
        assert_eq!(payload["task"], "fix #7");
        assert_eq!(payload["parent_branch_id"], "b-0");
        assert_eq!(payload["notes"], USER_NOTES);
        assert!(messages[1].content.contains("\n  \""));
    }
}
