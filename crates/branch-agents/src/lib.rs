//! Production adapters and process wiring for the `branch-agents` binary.
//!
//! - [`mcp_client::McpControlPlane`]: JSON-RPC client for the branch service
//! - [`llm_client::OpenAiCompletionClient`]: OpenAI-compatible chat completions
//! - [`config::AgentConfig`]: environment configuration
//! - [`cli`] / [`app`]: flag parsing, logging setup and report printing

pub mod app;
pub mod cli;
pub mod config;
pub mod llm_client;
pub mod mcp_client;
pub mod retry;
