//! Scripted mock backend for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::backend::{AiBackend, BackendError, ChatRequest, ChatResponse};

/// Backend returning pre-scripted responses in order. Once the script
/// is exhausted every call fails as transient.
#[derive(Default)]
pub struct MockBackend {
    script: Mutex<VecDeque<Result<ChatResponse, BackendError>>>,
    calls: AtomicU64,
    last_prompt: Mutex<Option<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful completion.
    pub fn push_text(&self, text: impl Into<String>) {
        self.script.lock().push_back(Ok(ChatResponse {
            text: text.into(),
            input_tokens: 100,
            output_tokens: 50,
        }));
    }

    /// Queue a failure.
    pub fn push_error(&self, error: BackendError) {
        self.script.lock().push_back(Err(error));
    }

    /// Number of completions attempted so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most recent user prompt, for assertions.
    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().clone()
    }
}

#[async_trait]
impl AiBackend for MockBackend {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock() = Some(request.user.clone());
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Transient("mock script exhausted".into())))
    }

    fn provider(&self) -> &'static str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }
}
