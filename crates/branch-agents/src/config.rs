//! Environment configuration.
//!
//! Everything is read once at startup into [`AgentConfig`]. Empty values
//! count as unset; CLI flags override what they overlap with.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use coordination::dispatch::PollConfig;

pub const ENV_LLM_BASE_URL: &str = "LLM_BASE_URL";
pub const ENV_LLM_API_KEY: &str = "LLM_API_KEY";
pub const ENV_LLM_MODEL: &str = "LLM_MODEL";
pub const ENV_AZURE_BASE_URL: &str = "AZURE_OPENAI_BASE_URL";
pub const ENV_AZURE_API_KEY: &str = "AZURE_OPENAI_API_KEY";
pub const ENV_AZURE_DEPLOYMENT: &str = "AZURE_OPENAI_DEPLOYMENT";
pub const ENV_AZURE_API_VERSION: &str = "AZURE_OPENAI_API_VERSION";

pub const ENV_MCP_BASE_URL: &str = "MCP_BASE_URL";
pub const ENV_POLL_INITIAL_SECONDS: &str = "MCP_POLL_INITIAL_SECONDS";
pub const ENV_POLL_MAX_SECONDS: &str = "MCP_POLL_MAX_SECONDS";
pub const ENV_POLL_BACKOFF_FACTOR: &str = "MCP_POLL_BACKOFF_FACTOR";
pub const ENV_POLL_TIMEOUT_SECONDS: &str = "MCP_POLL_TIMEOUT_SECONDS";

pub const ENV_PROJECT_NAME: &str = "PROJECT_NAME";
pub const ENV_WORKSPACE_DIR: &str = "WORKSPACE_DIR";

pub const DEFAULT_POLL_INITIAL_SECONDS: u64 = 5;
pub const DEFAULT_POLL_MAX_SECONDS: u64 = 600;
pub const DEFAULT_POLL_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_POLL_TIMEOUT_SECONDS: u64 = 3 * 60 * 60;
/// Agent branches routinely run for over an hour; shorter deadlines are raised.
pub const MIN_POLL_TIMEOUT_SECONDS: u64 = 2 * 60 * 60;

/// OpenAI-compatible endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: String,
    /// Model name, or deployment name for Azure.
    pub model: String,
    /// Set for Azure deployments.
    pub azure_api_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub llm: LlmSettings,
    pub mcp_base_url: String,
    pub poll: PollConfig,
    pub project_name: Option<String>,
    pub workspace_dir: Option<String>,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let first = |names: &[&str]| names.iter().find_map(|name| get(name));

        let llm = LlmSettings {
            base_url: first(&[ENV_LLM_BASE_URL, ENV_AZURE_BASE_URL])
                .with_context(|| format!("{ENV_LLM_BASE_URL} (or {ENV_AZURE_BASE_URL}) is required"))?,
            api_key: first(&[ENV_LLM_API_KEY, ENV_AZURE_API_KEY])
                .with_context(|| format!("{ENV_LLM_API_KEY} (or {ENV_AZURE_API_KEY}) is required"))?,
            model: first(&[ENV_LLM_MODEL, ENV_AZURE_DEPLOYMENT])
                .with_context(|| format!("{ENV_LLM_MODEL} (or {ENV_AZURE_DEPLOYMENT}) is required"))?,
            azure_api_version: get(ENV_AZURE_API_VERSION),
        };
        let mcp_base_url = get(ENV_MCP_BASE_URL).with_context(|| format!("{ENV_MCP_BASE_URL} is required"))?;

        let initial = parse_or(&get, ENV_POLL_INITIAL_SECONDS, DEFAULT_POLL_INITIAL_SECONDS)?;
        let max = parse_or(&get, ENV_POLL_MAX_SECONDS, DEFAULT_POLL_MAX_SECONDS)?;
        let backoff = parse_or(&get, ENV_POLL_BACKOFF_FACTOR, DEFAULT_POLL_BACKOFF_FACTOR)?;
        let timeout = parse_or(&get, ENV_POLL_TIMEOUT_SECONDS, DEFAULT_POLL_TIMEOUT_SECONDS)?;
        if !backoff.is_finite() {
            bail!("{ENV_POLL_BACKOFF_FACTOR} must be a finite number");
        }

        let poll = PollConfig::new(
            Duration::from_secs(initial),
            Duration::from_secs(max),
            backoff,
            Duration::from_secs(timeout.max(MIN_POLL_TIMEOUT_SECONDS)),
        );

        Ok(Self {
            llm,
            mcp_base_url,
            poll,
            project_name: get(ENV_PROJECT_NAME),
            workspace_dir: get(ENV_WORKSPACE_DIR),
        })
    }

    /// CLI value first, then the environment.
    pub fn resolve_project(&self, cli: Option<&str>) -> Result<String> {
        cli.map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .or_else(|| self.project_name.clone())
            .with_context(|| format!("project name is required (--project-name or {ENV_PROJECT_NAME})"))
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw:?}: {e}")),
    }
}
