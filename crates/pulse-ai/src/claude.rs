//! Anthropic messages-API completion backend.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::backend::{AiBackend, BackendError, ChatRequest, ChatResponse};
use pulse_core::defaults;

/// Default Anthropic API endpoint.
pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";

/// Default generation model.
pub const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// Anthropic messages-API backend.
pub struct ClaudeBackend {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ClaudeBackend {
    pub fn new(base_url: String, api_key: String, model: String) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(defaults::AI_TIMEOUT_SECS))
            .build()
            .map_err(|e| BackendError::Transient(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_key,
            model,
        })
    }

    /// Create from environment variables: `ANTHROPIC_API_KEY`,
    /// optional `ANTHROPIC_BASE_URL` and `ANTHROPIC_MODEL`.
    pub fn from_env(api_key: String) -> Result<Self, BackendError> {
        let base_url = std::env::var("ANTHROPIC_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_ANTHROPIC_URL.to_string());
        let model = std::env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Self::new(base_url, api_key, model)
    }
}

#[async_trait]
impl AiBackend for ClaudeBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, BackendError> {
        debug!(
            model = %self.model,
            prompt_len = request.user.len(),
            "claude completion request"
        );

        let body = MessagesRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens,
            system: request.system.clone(),
            messages: vec![Message {
                role: "user",
                content: request.user.clone(),
            }],
        };

        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ApiErrorResponse>()
                .await
                .map(|b| b.error.message)
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(BackendError::from_status(status, message));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Transient(format!("failed to parse response: {e}")))?;

        let text = parsed
            .content
            .iter()
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        let usage = parsed.usage.unwrap_or_default();

        debug!(response_len = text.len(), "claude completion ok");
        Ok(ChatResponse {
            text,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        })
    }

    fn provider(&self) -> &'static str {
        "claude"
    }

    fn model(&self) -> &str {
        &self.model
    }
}
