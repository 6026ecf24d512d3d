//! Command-line interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive remote coding-agent branches", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve an issue end to end and print the final report
    Dev(DevArgs),
    /// Review a PR, verify each finding, and print the result
    Review(ReviewArgs),
}

/// Flags shared by both subcommands.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Task description; read from stdin when omitted
    #[arg(long)]
    pub task: Option<String>,

    /// Branch the first agent runs on top of
    #[arg(long)]
    pub parent_branch_id: String,

    /// Project name (overrides PROJECT_NAME)
    #[arg(long)]
    pub project_name: Option<String>,

    /// Emit NDJSON run events on stdout
    #[arg(long)]
    pub stream_json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DevArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Maximum LLM turns (0 keeps the default)
    #[arg(long, default_value_t = 0)]
    pub max_turns: u32,

    /// Markdown file appended to the system prompt
    #[arg(long)]
    pub playbook: Option<PathBuf>,

    /// Skip the report finalizer pass
    #[arg(long)]
    pub no_finalize: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ReviewArgs {
    #[command(flatten)]
    pub run: RunArgs,

    /// Review the parent branch directly without a change-analysis scout
    #[arg(long)]
    pub skip_scout: bool,
}

impl Command {
    pub fn run_args(&self) -> &RunArgs {
        match self {
            Self::Dev(args) => &args.run,
            Self::Review(args) => &args.run,
        }
    }
}
