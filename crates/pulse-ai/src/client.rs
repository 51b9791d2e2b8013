//! Breaker-gated AI client with retry and call metrics.
//!
//! The client owns the circuit breaker. Every attempt acquires the
//! breaker, runs without holding its lock, and records the outcome —
//! so each failed attempt advances the breaker and a breaker that opens
//! mid-retry stops the loop on its next acquisition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::{AiBackend, BackendError, ChatRequest, ChatResponse};
use crate::breaker::{BreakerConfig, BreakerStatus, CircuitBreaker};
use crate::claude::ClaudeBackend;
use crate::openai::OpenAiBackend;
use pulse_core::{defaults, Error, Result};

/// Supported AI providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiProvider {
    Claude,
    OpenAi,
}

impl AiProvider {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "claude" | "anthropic" => Some(AiProvider::Claude),
            "openai" => Some(AiProvider::OpenAi),
            _ => None,
        }
    }

    /// Environment variable carrying this provider's API key.
    pub fn key_var(&self) -> &'static str {
        match self {
            AiProvider::Claude => "ANTHROPIC_API_KEY",
            AiProvider::OpenAi => "OPENAI_API_KEY",
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct AiClientConfig {
    pub provider: AiProvider,
    pub api_key: Option<String>,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for AiClientConfig {
    fn default() -> Self {
        Self {
            provider: AiProvider::Claude,
            api_key: None,
            max_retries: defaults::SUMMARIZATION_MAX_RETRIES,
            timeout: Duration::from_secs(defaults::AI_TIMEOUT_SECS),
        }
    }
}

impl AiClientConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `AI_PROVIDER` | `claude` |
    /// | `ANTHROPIC_API_KEY` / `OPENAI_API_KEY` | unset → client unavailable |
    /// | `SUMMARIZATION_MAX_RETRIES` | `3` |
    pub fn from_env() -> Self {
        let provider = std::env::var("AI_PROVIDER")
            .ok()
            .and_then(|v| AiProvider::parse(&v))
            .unwrap_or(AiProvider::Claude);
        let api_key = std::env::var(provider.key_var())
            .ok()
            .filter(|k| !k.is_empty());
        let max_retries = std::env::var("SUMMARIZATION_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::SUMMARIZATION_MAX_RETRIES);
        Self {
            provider,
            api_key,
            max_retries,
            timeout: Duration::from_secs(defaults::AI_TIMEOUT_SECS),
        }
    }
}

/// Latency and token accounting for one successful call.
#[derive(Debug, Clone, Serialize)]
pub struct LastCall {
    pub latency_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Default)]
struct CallMetrics {
    calls: AtomicU64,
    failures: AtomicU64,
    total_input_tokens: AtomicU64,
    total_output_tokens: AtomicU64,
    last: Mutex<Option<LastCall>>,
}

/// Serializable metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CallMetricsSnapshot {
    pub calls: u64,
    pub failures: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<LastCall>,
}

/// AI completion client: provider backend + circuit breaker + retry.
pub struct AiClient {
    backend: Option<Arc<dyn AiBackend>>,
    breaker: CircuitBreaker,
    max_retries: u32,
    timeout: Duration,
    metrics: CallMetrics,
}

impl AiClient {
    /// Build from an explicit backend (tests use [`crate::MockBackend`]).
    pub fn new(backend: Arc<dyn AiBackend>, breaker: CircuitBreaker, max_retries: u32) -> Self {
        Self {
            backend: Some(backend),
            breaker,
            max_retries,
            timeout: Duration::from_secs(defaults::AI_TIMEOUT_SECS),
            metrics: CallMetrics::default(),
        }
    }

    /// Build from environment configuration. Without an API key the
    /// client constructs fine but reports unavailable.
    pub fn from_env() -> Result<Self> {
        Self::from_config(AiClientConfig::from_env(), BreakerConfig::from_env())
    }

    pub fn from_config(config: AiClientConfig, breaker: BreakerConfig) -> Result<Self> {
        let backend: Option<Arc<dyn AiBackend>> = match (&config.api_key, config.provider) {
            (Some(key), AiProvider::Claude) => Some(Arc::new(
                ClaudeBackend::from_env(key.clone())
                    .map_err(|e| Error::Config(e.to_string()))?,
            )),
            (Some(key), AiProvider::OpenAi) => Some(Arc::new(
                OpenAiBackend::from_env(key.clone())
                    .map_err(|e| Error::Config(e.to_string()))?,
            )),
            (None, provider) => {
                warn!(
                    subsystem = "ai",
                    "no {} set, AI summaries disabled",
                    provider.key_var()
                );
                None
            }
        };
        Ok(Self {
            backend,
            breaker: CircuitBreaker::new(breaker),
            max_retries: config.max_retries,
            timeout: config.timeout,
            metrics: CallMetrics::default(),
        })
    }

    /// API key present and the breaker currently permits calls.
    /// Read-only: never consumes the half-open probe slot.
    pub fn available(&self) -> bool {
        self.backend.is_some() && self.breaker.would_permit()
    }

    /// Run one completion through the breaker with retry.
    ///
    /// Up to `max_retries` attempts with exponential backoff
    /// `min(base · 2^k, max)` plus 10% jitter. Auth failures are
    /// terminal; a 429 adds one extra backoff doubling. Timeouts and
    /// cancellations count as failures against the breaker.
    pub async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let Some(backend) = self.backend.as_ref() else {
            return Err(Error::ExternalUnavailable(
                "no AI API key configured".to_string(),
            ));
        };

        let mut extra_doublings: u32 = 0;
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            if !self.breaker.can_execute() {
                return Err(Error::ExternalUnavailable(
                    "circuit breaker open".to_string(),
                ));
            }

            let start = Instant::now();
            let outcome = tokio::time::timeout(self.timeout, backend.complete(request)).await;

            match outcome {
                Ok(Ok(response)) => {
                    let latency_ms = start.elapsed().as_millis() as u64;
                    self.breaker.record_success();
                    self.record_success_metrics(&response, latency_ms);
                    debug!(
                        subsystem = "ai",
                        provider = backend.provider(),
                        model = backend.model(),
                        duration_ms = latency_ms,
                        input_tokens = response.input_tokens,
                        output_tokens = response.output_tokens,
                        "AI call succeeded"
                    );
                    return Ok(response);
                }
                Ok(Err(error)) => {
                    self.breaker.record_failure(&error.to_string());
                    self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                    match error {
                        BackendError::Terminal(message) => {
                            warn!(subsystem = "ai", error = %message, "terminal AI failure");
                            return Err(Error::ExternalUnavailable(message));
                        }
                        BackendError::RateLimited(message) => {
                            extra_doublings += 1;
                            last_error = message;
                        }
                        BackendError::Transient(message) => {
                            last_error = message;
                        }
                    }
                }
                Err(_) => {
                    // The elapsed timeout dropped the in-flight future,
                    // closing the connection; that counts as a failure.
                    self.breaker.record_failure("request timed out");
                    self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                    last_error = format!("request timed out after {:?}", self.timeout);
                }
            }

            if attempt + 1 < self.max_retries {
                let delay = Self::backoff(attempt + extra_doublings);
                debug!(
                    subsystem = "ai",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "retrying AI call"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(Error::ExternalUnavailable(last_error))
    }

    /// `min(base · 2^k, max)` plus 10% jitter.
    fn backoff(k: u32) -> Duration {
        let base = defaults::AI_BACKOFF_BASE_MS.saturating_mul(1u64 << k.min(16));
        let capped = base.min(defaults::AI_BACKOFF_MAX_MS);
        let jitter = (capped as f64 * rand::thread_rng().gen_range(0.0..0.1)) as u64;
        Duration::from_millis(capped + jitter)
    }

    fn record_success_metrics(&self, response: &ChatResponse, latency_ms: u64) {
        self.metrics.calls.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .total_input_tokens
            .fetch_add(response.input_tokens, Ordering::Relaxed);
        self.metrics
            .total_output_tokens
            .fetch_add(response.output_tokens, Ordering::Relaxed);
        *self.metrics.last.lock() = Some(LastCall {
            latency_ms,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
        });
    }

    pub fn metrics_snapshot(&self) -> CallMetricsSnapshot {
        CallMetricsSnapshot {
            calls: self.metrics.calls.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            total_input_tokens: self.metrics.total_input_tokens.load(Ordering::Relaxed),
            total_output_tokens: self.metrics.total_output_tokens.load(Ordering::Relaxed),
            last: self.metrics.last.lock().clone(),
        }
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.breaker.status()
    }

    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::mock::MockBackend;

    fn client_with(mock: Arc<MockBackend>, max_retries: u32) -> AiClient {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 10,
            success_threshold: 1,
            timeout: Duration::from_millis(50),
        });
        let mut client = AiClient::new(mock, breaker, max_retries);
        client.timeout = Duration::from_secs(5);
        client
    }

    #[tokio::test]
    async fn test_complete_success_records_metrics() {
        let mock = Arc::new(MockBackend::new());
        mock.push_text("summary text");
        let client = client_with(mock.clone(), 3);

        let response = client
            .complete(&ChatRequest::new("system", "prompt"))
            .await
            .unwrap();
        assert_eq!(response.text, "summary text");

        let metrics = client.metrics_snapshot();
        assert_eq!(metrics.calls, 1);
        assert_eq!(metrics.failures, 0);
        let last = metrics.last.unwrap();
        assert_eq!(last.input_tokens, 100);
        assert_eq!(last.output_tokens, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_then_succeed() {
        let mock = Arc::new(MockBackend::new());
        mock.push_error(BackendError::Transient("502".into()));
        mock.push_error(BackendError::Transient("502".into()));
        mock.push_text("eventually");
        let client = client_with(mock.clone(), 3);

        let response = client
            .complete(&ChatRequest::new("", "prompt"))
            .await
            .unwrap();
        assert_eq!(response.text, "eventually");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_stops_retrying() {
        let mock = Arc::new(MockBackend::new());
        mock.push_error(BackendError::Terminal("401 invalid key".into()));
        mock.push_text("should never be consumed");
        let client = client_with(mock.clone(), 3);

        let result = client.complete(&ChatRequest::new("", "prompt")).await;
        assert!(matches!(result, Err(Error::ExternalUnavailable(_))));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_returns_last_error() {
        let mock = Arc::new(MockBackend::new());
        for _ in 0..3 {
            mock.push_error(BackendError::Transient("503 upstream".into()));
        }
        let client = client_with(mock.clone(), 3);

        let result = client.complete(&ChatRequest::new("", "prompt")).await;
        match result {
            Err(Error::ExternalUnavailable(message)) => {
                assert!(message.contains("503"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(mock.call_count(), 3);
        assert_eq!(client.metrics_snapshot().failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_advance_breaker_until_open() {
        let mock = Arc::new(MockBackend::new());
        for _ in 0..4 {
            mock.push_error(BackendError::Transient("boom".into()));
        }
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            success_threshold: 1,
            timeout: Duration::from_secs(60),
        });
        let client = AiClient::new(mock.clone(), breaker, 4);

        let result = client.complete(&ChatRequest::new("", "prompt")).await;
        assert!(result.is_err());
        // Two attempts opened the breaker; the third acquisition
        // fast-failed without consuming the script.
        assert_eq!(mock.call_count(), 2);
        assert_eq!(client.breaker_status().state, BreakerState::Open);
        assert!(!client.available());
    }

    #[tokio::test]
    async fn test_unavailable_without_key() {
        let client = AiClient::from_config(
            AiClientConfig {
                api_key: None,
                ..Default::default()
            },
            BreakerConfig::default(),
        )
        .unwrap();
        assert!(!client.available());
        let result = client.complete(&ChatRequest::new("", "prompt")).await;
        assert!(matches!(result, Err(Error::ExternalUnavailable(_))));
    }

    #[test]
    fn test_backoff_capped() {
        let small = AiClient::backoff(0);
        assert!(small >= Duration::from_millis(1_000));
        assert!(small < Duration::from_millis(1_200));

        let capped = AiClient::backoff(12);
        assert!(capped >= Duration::from_millis(30_000));
        assert!(capped < Duration::from_millis(33_001));
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!(AiProvider::parse("claude"), Some(AiProvider::Claude));
        assert_eq!(AiProvider::parse("OpenAI"), Some(AiProvider::OpenAi));
        assert_eq!(AiProvider::parse("gemini"), None);
    }
}
