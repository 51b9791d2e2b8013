//! HTTP-level backend tests against a local mock server.

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pulse_ai::{AiBackend, BackendError, ChatRequest, ClaudeBackend, OpenAiBackend};

#[tokio::test]
async fn openai_backend_parses_completion_and_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "{\"incidents\": []}"}}],
            "usage": {"prompt_tokens": 321, "completion_tokens": 42}
        })))
        .mount(&server)
        .await;

    let backend = OpenAiBackend::new(server.uri(), "test-key".into(), "gpt-4o-mini".into()).unwrap();
    let response = backend
        .complete(&ChatRequest::new("system", "analyze this"))
        .await
        .unwrap();

    assert_eq!(response.text, "{\"incidents\": []}");
    assert_eq!(response.input_tokens, 321);
    assert_eq!(response.output_tokens, 42);
}

#[tokio::test]
async fn openai_backend_maps_auth_failure_to_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": {"message": "Incorrect API key provided"}
        })))
        .mount(&server)
        .await;

    let backend = OpenAiBackend::new(server.uri(), "bad-key".into(), "gpt-4o-mini".into()).unwrap();
    let error = backend
        .complete(&ChatRequest::new("", "prompt"))
        .await
        .unwrap_err();
    match error {
        BackendError::Terminal(message) => assert!(message.contains("Incorrect API key")),
        other => panic!("expected terminal error, got {other:?}"),
    }
}

#[tokio::test]
async fn openai_backend_maps_429_to_rate_limited() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
            "error": {"message": "Rate limit reached"}
        })))
        .mount(&server)
        .await;

    let backend = OpenAiBackend::new(server.uri(), "key".into(), "gpt-4o-mini".into()).unwrap();
    let error = backend
        .complete(&ChatRequest::new("", "prompt"))
        .await
        .unwrap_err();
    assert!(matches!(error, BackendError::RateLimited(_)));
}

#[tokio::test]
async fn claude_backend_parses_content_blocks() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "content": [
                {"type": "text", "text": "{\"summary\": "},
                {"type": "text", "text": "\"ok\"}"}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 5}
        })))
        .mount(&server)
        .await;

    let backend = ClaudeBackend::new(server.uri(), "test-key".into(), "claude-test".into()).unwrap();
    let response = backend
        .complete(&ChatRequest::new("system", "analyze"))
        .await
        .unwrap();
    assert_eq!(response.text, "{\"summary\": \"ok\"}");
    assert_eq!(response.input_tokens, 10);
}

#[tokio::test]
async fn claude_backend_maps_5xx_to_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
            "error": {"message": "overloaded"}
        })))
        .mount(&server)
        .await;

    let backend = ClaudeBackend::new(server.uri(), "key".into(), "claude-test".into()).unwrap();
    let error = backend
        .complete(&ChatRequest::new("", "prompt"))
        .await
        .unwrap_err();
    assert!(matches!(error, BackendError::Transient(_)));
}
