//! Provider backend seam: plain text-in / text-out completion.

use async_trait::async_trait;
use thiserror::Error;

/// One completion request: a system preamble plus a user message.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_tokens: 2048,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Completion text plus token accounting from the provider.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Backend-level failure classification driving the retry policy:
/// auth failures are terminal, rate limits get an extra backoff
/// doubling, everything else retries normally.
#[derive(Error, Debug)]
pub enum BackendError {
    /// HTTP 401/403; retrying cannot help.
    #[error("authentication rejected: {0}")]
    Terminal(String),

    /// HTTP 429.
    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    /// Network faults, 5xx, malformed bodies.
    #[error("provider call failed: {0}")]
    Transient(String),
}

impl BackendError {
    /// Map an HTTP status plus provider message onto the retry classes.
    pub fn from_status(status: reqwest::StatusCode, message: String) -> Self {
        match status.as_u16() {
            401 | 403 => BackendError::Terminal(format!("{status}: {message}")),
            429 => BackendError::RateLimited(format!("{status}: {message}")),
            _ => BackendError::Transient(format!("{status}: {message}")),
        }
    }
}

/// A pluggable completion provider.
#[async_trait]
pub trait AiBackend: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, BackendError>;

    /// Provider tag for logging ("claude", "openai", "mock").
    fn provider(&self) -> &'static str;

    /// Model identifier sent to the provider.
    fn model(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_status_classes() {
        use reqwest::StatusCode;
        assert!(matches!(
            BackendError::from_status(StatusCode::UNAUTHORIZED, "bad key".into()),
            BackendError::Terminal(_)
        ));
        assert!(matches!(
            BackendError::from_status(StatusCode::FORBIDDEN, "no access".into()),
            BackendError::Terminal(_)
        ));
        assert!(matches!(
            BackendError::from_status(StatusCode::TOO_MANY_REQUESTS, "slow down".into()),
            BackendError::RateLimited(_)
        ));
        assert!(matches!(
            BackendError::from_status(StatusCode::INTERNAL_SERVER_ERROR, "oops".into()),
            BackendError::Transient(_)
        ));
    }

    #[test]
    fn test_chat_request_builder() {
        let req = ChatRequest::new("system", "user").with_max_tokens(512);
        assert_eq!(req.max_tokens, 512);
        assert_eq!(req.system, "system");
    }
}
