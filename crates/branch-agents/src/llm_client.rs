//! OpenAI-compatible chat completion client.

use std::time::Duration;

use async_trait::async_trait;
use coordination::completion::{
    AssistantTurn, ChatMessage, CompletionError, CompletionService, ToolCall, ToolDefinition,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::LlmSettings;
use crate::retry::{is_transient_reqwest, is_transient_status, RetryPolicy};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    /// Some compatible servers send `null` instead of omitting the field.
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

/// Attempt-level failure; only `Transient` is retried.
#[derive(Debug, Error)]
enum Attempt {
    #[error("{0}")]
    Transient(String),
    #[error(transparent)]
    Fatal(CompletionError),
}

pub struct OpenAiCompletionClient {
    client: reqwest::Client,
    settings: LlmSettings,
    retry: RetryPolicy,
}

impl OpenAiCompletionClient {
    pub fn new(settings: LlmSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            settings,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Chat completions URL; Azure deployments use their own path shape.
    pub fn endpoint(&self) -> String {
        let base = self.settings.base_url.trim_end_matches('/');
        match &self.settings.azure_api_version {
            Some(version) => format!(
                "{base}/openai/deployments/{}/chat/completions?api-version={version}",
                self.settings.model
            ),
            None => format!("{base}/chat/completions"),
        }
    }

    async fn send_once(&self, body: &ChatRequest<'_>) -> Result<AssistantTurn, Attempt> {
        let mut request = self.client.post(self.endpoint()).json(body);
        request = if self.settings.azure_api_version.is_some() {
            request.header("api-key", &self.settings.api_key)
        } else {
            request.bearer_auth(&self.settings.api_key)
        };

        let response = request.send().await.map_err(|e| {
            if is_transient_reqwest(&e) {
                Attempt::Transient(format!("LLM request failed: {e}"))
            } else {
                Attempt::Fatal(CompletionError::Request(e.to_string()))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("LLM API error ({status}): {text}");
            return Err(if is_transient_status(status) {
                Attempt::Transient(message)
            } else {
                Attempt::Fatal(CompletionError::Request(message))
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| Attempt::Fatal(CompletionError::Malformed(e.to_string())))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(Attempt::Fatal(CompletionError::Empty))?;

        Ok(AssistantTurn {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletionClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<AssistantTurn, CompletionError> {
        let body = ChatRequest {
            model: &self.settings.model,
            messages,
            tools: tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect(),
        };
        debug!(messages = messages.len(), tools = tools.len(), "LLM completion request");

        self.retry
            .run("chat_completion", |e| matches!(e, Attempt::Transient(_)), || self.send_once(&body))
            .await
            .map_err(|e| match e {
                Attempt::Transient(msg) => CompletionError::Request(msg),
                Attempt::Fatal(e) => e,
            })
    }
}
