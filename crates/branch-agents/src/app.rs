//! Wiring: config + CLI flags into the coordination engines.

use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use coordination::completion::CompletionService;
use coordination::control_plane::ControlPlane;
use coordination::dispatch::AgentDispatcher;
use coordination::events::{EventStream, RunEvent};
use coordination::orchestrator::{DevSession, FinalReport, RunContext, TurnLimits};
use coordination::tools::ToolHandler;
use coordination::verification::{ReviewOptions, ReviewResult, ReviewRunner};
use serde_json::Value;
use tracing::{error, info};

use crate::cli::{Cli, Command, DevArgs, ReviewArgs, RunArgs};
use crate::config::AgentConfig;
use crate::llm_client::OpenAiCompletionClient;
use crate::mcp_client::{McpControlPlane, DEV_AGENT_TAG, REVIEW_AGENT_TAG};

pub const TASK_PROMPT: &str = "you> Enter task description: ";

/// Install the stderr subscriber. Streaming runs default to `error` so the
/// terminal only shows the event stream unless `RUST_LOG` says otherwise.
pub fn init_tracing(stream_json: bool) {
    let default_filter = if stream_json { "error" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// `--task` when given, else one line from `input` after writing the prompt.
pub fn resolve_task(flag: Option<&str>, mut input: impl BufRead, mut prompt: impl Write) -> Result<String> {
    if let Some(task) = flag.map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(task.to_string());
    }
    write!(prompt, "{TASK_PROMPT}")?;
    prompt.flush()?;
    let mut line = String::new();
    input.read_line(&mut line).context("reading task from stdin")?;
    let task = line.trim();
    if task.is_empty() {
        bail!("--task is required");
    }
    Ok(task.to_string())
}

/// Run the selected subcommand. Returns `false` when the run ended in an
/// error status.
pub async fn run(cli: Cli) -> Result<bool> {
    let config = AgentConfig::from_env().context("Configuration error")?;
    let args = cli.command.run_args();
    let task = resolve_task(args.task.as_deref(), std::io::stdin().lock(), std::io::stderr())?;

    let (report, ok) = match &cli.command {
        Command::Dev(dev) => {
            let report = run_dev(&config, dev, &task).await?;
            let ok = !report.is_error();
            (report.to_json(), ok)
        }
        Command::Review(review) => {
            let result = run_review(&config, review, &task).await?;
            (serde_json::to_value(&result)?, true)
        }
    };
    print_report(&report, args.stream_json)?;
    Ok(ok)
}

fn dispatcher(config: &AgentConfig, args: &RunArgs, agent_tag: &str) -> Result<Arc<AgentDispatcher>> {
    if args.parent_branch_id.trim().is_empty() {
        bail!("--parent-branch-id is required");
    }
    let project = config.resolve_project(args.project_name.as_deref())?;
    let plane: Arc<dyn ControlPlane> = Arc::new(McpControlPlane::new(&config.mcp_base_url, agent_tag)?);
    let mut dispatcher = AgentDispatcher::new(plane, config.poll.clone()).with_default_project(project);
    if let Some(dir) = &config.workspace_dir {
        dispatcher = dispatcher.with_workspace_dir(dir.clone());
    }
    Ok(Arc::new(dispatcher))
}

fn completion(config: &AgentConfig) -> Result<Arc<dyn CompletionService>> {
    Ok(Arc::new(OpenAiCompletionClient::new(config.llm.clone())?))
}

fn events(stream_json: bool) -> EventStream {
    if stream_json {
        EventStream::stdout()
    } else {
        EventStream::disabled()
    }
}

pub async fn run_dev(config: &AgentConfig, args: &DevArgs, task: &str) -> Result<FinalReport> {
    let dispatcher = dispatcher(config, &args.run, DEV_AGENT_TAG)?;
    let playbook = match &args.playbook {
        Some(path) => Some(
            std::fs::read_to_string(path).with_context(|| format!("reading playbook {}", path.display()))?,
        ),
        None => None,
    };

    let context = RunContext {
        task: task.to_string(),
        parent_branch_id: args.run.parent_branch_id.trim().to_string(),
        project_name: dispatcher.default_project().to_string(),
        workspace_dir: config.workspace_dir.clone().unwrap_or_default(),
    };
    info!(
        project = %context.project_name,
        parent_branch_id = %context.parent_branch_id,
        "Starting dev run"
    );

    let mut session = DevSession::new(completion(config)?, Arc::new(ToolHandler::new(dispatcher)))
        .with_limits(TurnLimits::default().with_max_turns(args.max_turns))
        .with_events(events(args.run.stream_json));
    if args.no_finalize {
        session = session.without_finalizer();
    }

    let report = session.run(&context, playbook.as_deref()).await?;
    if report.is_error() {
        error!(status = %report.status(), "Dev run finished with error");
    }
    Ok(report)
}

pub async fn run_review(config: &AgentConfig, args: &ReviewArgs, task: &str) -> Result<ReviewResult> {
    let dispatcher = dispatcher(config, &args.run, REVIEW_AGENT_TAG)?;
    let events = events(args.run.stream_json);
    let options = ReviewOptions {
        task: task.to_string(),
        project_name: dispatcher.default_project().to_string(),
        parent_branch_id: args.run.parent_branch_id.clone(),
        workspace_dir: config.workspace_dir.clone(),
        skip_scout: args.skip_scout,
    };

    events.emit(RunEvent::ThreadStarted {
        task: task.to_string(),
        project_name: options.project_name.clone(),
        parent_branch_id: options.parent_branch_id.clone(),
        headless: true,
    });
    let runner = ReviewRunner::new(completion(config)?, dispatcher, options)?.with_events(events.clone());

    match runner.run().await {
        Ok(result) => {
            events.emit(RunEvent::ThreadCompleted {
                status: result.status.as_str().to_string(),
                summary: result.summary.clone(),
                report: serde_json::to_value(&result).unwrap_or(Value::Null),
            });
            Ok(result)
        }
        Err(err) => {
            events.emit(RunEvent::Error {
                scope: "review".into(),
                message: err.to_string(),
                extra: Value::Null,
            });
            events.emit(RunEvent::ThreadCompleted {
                status: "error".into(),
                summary: err.to_string(),
                report: Value::Null,
            });
            Err(err.into())
        }
    }
}

/// Pretty JSON to stderr while streaming (stdout carries events), else stdout.
fn print_report(report: &Value, stream_json: bool) -> Result<()> {
    let text = serde_json::to_string_pretty(report)?;
    if stream_json {
        eprintln!("{text}");
    } else {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{text}")?;
        out.flush()?;
    }
    Ok(())
}
