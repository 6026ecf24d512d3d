//! Bounded, single-tool-call-per-turn conversation with the LLM.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use super::report::{parse_final_report, FinalReport, STATUS_COMPLETED, STATUS_FINISHED_WITH_ERROR};
use crate::completion::{AssistantTurn, ChatMessage, CompletionError, CompletionService};
use crate::control_plane::extract_branch_id;
use crate::error::{ToolExecutionError, ToolOutcome};
use crate::events::{sanitize_tool_args, EventStream, ItemKind, ItemStatus, RunEvent};
use crate::tools::ToolExecutor;
use crate::truncate::preview;

pub const DEFAULT_MAX_TURNS: u32 = 60;
pub const DEFAULT_MAX_TOOL_CALLS: u32 = 40;
pub const DEFAULT_MAX_POLICY_RETRIES: u32 = 6;

pub const POLICY_ABORT_SUMMARY: &str = "Too many policy-violation retries; aborting.";

const EVENT_PREVIEW_CHARS: usize = 200;

/// Ceilings of one loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnLimits {
    pub max_turns: u32,
    /// Executed (not requested) tool calls.
    pub max_tool_calls: u32,
    /// Consecutive turns with the wrong number of tool calls.
    pub max_policy_retries: u32,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            max_policy_retries: DEFAULT_MAX_POLICY_RETRIES,
        }
    }
}

impl TurnLimits {
    /// Override the turn ceiling; zero keeps the current value.
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        if max_turns > 0 {
            self.max_turns = max_turns;
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Completion(#[from] CompletionError),
}

/// What a loop run produced.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub report: FinalReport,
    pub messages: Vec<ChatMessage>,
    pub turns: u32,
    pub executed_tool_calls: u32,
}

/// Drives the LLM turn by turn until it emits a final report, a tool halts
/// the run, or a ceiling is hit.
pub struct TurnLoop {
    completion: Arc<dyn CompletionService>,
    tools: Arc<dyn ToolExecutor>,
    limits: TurnLimits,
    events: EventStream,
}

enum Stop {
    Report(FinalReport),
    Error(FinalReport),
}

impl TurnLoop {
    pub fn new(completion: Arc<dyn CompletionService>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            completion,
            tools,
            limits: TurnLimits::default(),
            events: EventStream::disabled(),
        }
    }

    pub fn with_limits(mut self, limits: TurnLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_events(mut self, events: EventStream) -> Self {
        self.events = events;
        self
    }

    pub fn limits(&self) -> TurnLimits {
        self.limits
    }

    /// Run the loop from `messages`.
    ///
    /// Only an LLM failure returns `Err`; every other ending is a report.
    pub async fn run(&self, task: &str, mut messages: Vec<ChatMessage>) -> Result<LoopOutcome, RunError> {
        let catalog = self.tools.definitions();
        let mut requested_calls: u32 = 0;
        let mut executed_calls: u32 = 0;
        let mut policy_retries: u32 = 0;
        let mut stop: Option<Stop> = None;
        let mut turns: u32 = 0;

        for iteration in 1..=self.limits.max_turns {
            turns = iteration;
            let turn_id = format!("turn_{iteration}");
            info!(iteration, messages = messages.len(), "LLM iteration");
            self.events.emit(RunEvent::TurnStarted {
                turn_id: turn_id.clone(),
                iteration,
                message_count: messages.len(),
                tool_calls_so_far: requested_calls,
            });

            let reply = match self.completion.complete(&messages, &catalog).await {
                Ok(reply) => reply,
                Err(err) => {
                    error!(iteration, error = %err, "LLM completion failed");
                    self.events.emit(RunEvent::Error {
                        scope: "llm.complete".into(),
                        message: err.to_string(),
                        extra: json!({ "iteration": iteration, "turn_id": turn_id }),
                    });
                    return Err(err.into());
                }
            };
            messages.push(reply.to_message());
            self.events.emit(RunEvent::AssistantMessage {
                turn_id: turn_id.clone(),
                preview: preview(&reply.content, EVENT_PREVIEW_CHARS),
                tool_calls: reply.tool_calls.len(),
            });

            if reply.tool_calls.is_empty() {
                let report = parse_final_report(&reply.content);
                let has_final = report.is_some();
                self.events.emit(RunEvent::TurnCompleted {
                    turn_id,
                    iteration,
                    tool_calls: 0,
                    has_final,
                });
                match report {
                    Some(report) => {
                        stop = Some(Stop::Report(report));
                        break;
                    }
                    None => {
                        info!(iteration, "Assistant response was not a final report; continuing");
                        continue;
                    }
                }
            }

            let call_count = reply.tool_calls.len();
            requested_calls += u32::try_from(call_count).unwrap_or(u32::MAX);

            if call_count != 1 {
                policy_retries += 1;
                self.reject_turn(&reply, &turn_id, &mut messages);
                self.events.emit(RunEvent::TurnCompleted {
                    turn_id: turn_id.clone(),
                    iteration,
                    tool_calls: call_count,
                    has_final: false,
                });
                if policy_retries >= self.limits.max_policy_retries {
                    warn!(policy_retries, "Aborting after repeated policy violations");
                    let mut report = FinalReport::error(task, POLICY_ABORT_SUMMARY, None);
                    if let Some(Value::Object(payload)) = report.error.as_mut() {
                        payload.insert("details".into(), json!({ "turn_id": turn_id }));
                    }
                    stop = Some(Stop::Error(report));
                    break;
                }
                continue;
            }

            policy_retries = 0;
            let outcome = self.execute(&reply, &mut messages).await;
            executed_calls += 1;
            self.events.emit(RunEvent::TurnCompleted {
                turn_id,
                iteration,
                tool_calls: 1,
                has_final: false,
            });

            if let Some(err) = outcome.error().filter(|e| e.is_fatal()) {
                error!(error = %err, "Tool requested workflow termination");
                self.events.emit(RunEvent::Error {
                    scope: "tool_instruction".into(),
                    message: err.message.clone(),
                    extra: json!({ "instruction": err.instruction }),
                });
                stop = Some(Stop::Error(FinalReport::error(task, &err.message, Some(err))));
                break;
            }
            if executed_calls >= self.limits.max_tool_calls {
                error!(executed_calls, "Reached tool-call limit without final report");
                break;
            }
        }

        let report = match stop {
            Some(Stop::Report(mut report)) => {
                report.ensure_defaults(task, STATUS_COMPLETED);
                report
            }
            Some(Stop::Error(mut report)) => {
                report.ensure_defaults(task, STATUS_FINISHED_WITH_ERROR);
                report
            }
            None => FinalReport::iteration_limit(task),
        };
        Ok(LoopOutcome {
            report,
            messages,
            turns,
            executed_tool_calls: executed_calls,
        })
    }

    /// Answer every call of an over- or under-sized turn with the same error.
    fn reject_turn(&self, reply: &AssistantTurn, turn_id: &str, messages: &mut Vec<ChatMessage>) {
        let count = reply.tool_calls.len();
        let message = format!(
            "policy violation: expected exactly 1 tool call, got {count}. No tool calls executed. Please retry with a single tool call."
        );
        warn!(turn_id, tool_calls = count, "Tool-call policy violation");
        self.events.emit(RunEvent::Error {
            scope: "tool_policy".into(),
            message: message.clone(),
            extra: json!({ "tool_call_count": count, "turn_id": turn_id }),
        });
        let envelope = ToolOutcome::Failure(ToolExecutionError::recoverable(message))
            .to_json()
            .to_string();
        for call in &reply.tool_calls {
            messages.push(ChatMessage::tool(call.id.clone(), envelope.clone()));
        }
    }

    async fn execute(&self, reply: &AssistantTurn, messages: &mut Vec<ChatMessage>) -> ToolOutcome {
        let call = &reply.tool_calls[0];
        let item_id = self.events.next_item_id();
        self.events.emit(RunEvent::ItemStarted {
            item_id: item_id.clone(),
            kind: ItemKind::ToolCall,
            name: call.function.name.clone(),
            args: sanitize_tool_args(&call.function.arguments),
        });
        info!(tool = %call.function.name, call_id = %call.id, "Executing tool call");

        let started = Instant::now();
        let outcome = self.tools.handle(call).await;
        let elapsed = started.elapsed();
        messages.push(ChatMessage::tool(call.id.clone(), outcome.to_json().to_string()));

        self.events.emit(RunEvent::ItemCompleted {
            item_id,
            status: match outcome {
                ToolOutcome::Success(_) => ItemStatus::Success,
                ToolOutcome::Failure(_) => ItemStatus::Error,
            },
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            branch_id: outcome.data().and_then(extract_branch_id),
            summary: summarize_outcome(&outcome),
        });
        outcome
    }
}

fn summarize_outcome(outcome: &ToolOutcome) -> Option<String> {
    let text = match outcome {
        ToolOutcome::Failure(err) => preview(&err.message, EVENT_PREVIEW_CHARS),
        ToolOutcome::Success(data) => {
            if let Some(response) = data.get("response").and_then(Value::as_str).filter(|s| !s.trim().is_empty()) {
                preview(response, EVENT_PREVIEW_CHARS)
            } else if let Some(status) = data.get("status").and_then(Value::as_str) {
                format!("status={}", status.trim())
            } else {
                String::new()
            }
        }
    };
    (!text.is_empty()).then_some(text)
}
