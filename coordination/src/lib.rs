//! Branch Agent Coordination Library
//!
//! Core engines for driving remote coding agents that run as branches of a
//! versioned workspace:
//!
//! - **Dispatch**: launch an agent branch, poll it to a terminal state with
//!   geometric backoff, and collect its output (`dispatch`)
//! - **Orchestration**: a bounded, one-tool-call-per-turn LLM loop that ends
//!   in a structured final report (`orchestrator`)
//! - **Verification**: two-role consensus on review findings and the PR
//!   review pipeline around it (`verification`)
//!
//! External systems are reached through two ports:
//! [`ControlPlane`] for the branch service and [`CompletionService`] for the
//! LLM. Production adapters live in the `branch-agents` crate.
//!
//! # Usage
//!
//! ```bash
//! # Resolve an issue end to end
//! branch-agents dev --task "Fix #42" --parent-branch-id <id>
//!
//! # Review a PR and verify each finding
//! branch-agents review --task "Review PR #7" --parent-branch-id <id> --stream-json
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod completion;
pub mod control_plane;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod lineage;
pub mod orchestrator;
pub mod tools;
pub mod truncate;
pub mod verification;

// Shared data model
pub use error::{Instruction, ToolExecutionError, ToolOutcome};
pub use lineage::{BranchLineage, BranchRange};
pub use truncate::truncate_text;

// Ports
pub use completion::{
    AssistantTurn, ChatMessage, CompletionError, CompletionService, Role, ToolCall, ToolDefinition,
};
pub use control_plane::{ControlPlane, ControlPlaneError, LaunchRequest};

// Dispatch
pub use dispatch::{AgentDispatcher, AgentExecutor, AgentRequest, AgentRun, PollConfig};
pub use tools::{ToolExecutor, ToolHandler};

// Orchestration
pub use orchestrator::{DevSession, FinalReport, RunContext, RunError, TurnLimits, TurnLoop};

// Events
pub use events::{EventStream, RunEvent};

// Verification
pub use verification::{
    IssueReport, IssueStatus, IssueVerifier, ReviewOptions, ReviewResult, ReviewRunner, ReviewStatus,
    VerificationError, Verdict,
};
