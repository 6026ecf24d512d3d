//! Event types of the run stream.
//!
//! Each variant becomes one NDJSON line; the stream adds the envelope fields
//! (`timestamp`, `sequence`, `thread_id`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of work an item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    ToolCall,
    ReviewStep,
}

/// Outcome of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Error,
}

/// All run events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run began.
    ThreadStarted {
        task: String,
        project_name: String,
        parent_branch_id: String,
        headless: bool,
    },

    /// The LLM is about to be asked for the next turn.
    TurnStarted {
        turn_id: String,
        iteration: u32,
        message_count: usize,
        tool_calls_so_far: u32,
    },

    /// The LLM replied.
    AssistantMessage {
        turn_id: String,
        preview: String,
        tool_calls: usize,
    },

    /// A turn ended, with or without a final report.
    TurnCompleted {
        turn_id: String,
        iteration: u32,
        tool_calls: usize,
        has_final: bool,
    },

    /// A tool call or review step started.
    ItemStarted {
        item_id: String,
        kind: ItemKind,
        name: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        args: Value,
    },

    /// A tool call or review step ended.
    ItemCompleted {
        item_id: String,
        status: ItemStatus,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    /// Something failed outside a tool result.
    Error {
        scope: String,
        message: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        extra: Value,
    },

    /// The run finished.
    ThreadCompleted {
        status: String,
        summary: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        report: Value,
    },
}

impl RunEvent {
    /// Wire name of the event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ThreadStarted { .. } => "thread_started",
            Self::TurnStarted { .. } => "turn_started",
            Self::AssistantMessage { .. } => "assistant_message",
            Self::TurnCompleted { .. } => "turn_completed",
            Self::ItemStarted { .. } => "item_started",
            Self::ItemCompleted { .. } => "item_completed",
            Self::Error { .. } => "error",
            Self::ThreadCompleted { .. } => "thread_completed",
        }
    }
}
