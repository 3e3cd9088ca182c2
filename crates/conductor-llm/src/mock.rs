//! Mock provider for deterministic testing.
//!
//! Returns pre-configured responses without making any HTTP calls.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use conductor_core::{
    Capabilities, ConductorError, FinishReason, ModelInfo, ModelTier, Result, TokenUsage,
    ToolInvocation,
};

use crate::provider::{Completion, CompletionRequest, Provider, StreamChunk, StreamDelta};

/// A pre-configured response from the mock provider.
#[derive(Clone)]
pub struct MockResponse {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
    /// When set, the call fails with a provider error of this status/message.
    pub error: Option<(Option<u16>, String)>,
    /// When set, a stream delivers its text and then terminates with an
    /// in-band error instead of a finish chunk.
    pub stream_error: Option<String>,
    /// Artificial latency before the call resolves.
    pub delay: Duration,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![],
            finish_reason: FinishReason::Stop,
            usage: TokenUsage::new(4, 1),
            error: None,
            stream_error: None,
            delay: Duration::ZERO,
        }
    }
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn error(status: Option<u16>, message: &str) -> Self {
        Self {
            error: Some((status, message.to_string())),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_stream_error(mut self, message: &str) -> Self {
        self.stream_error = Some(message.to_string());
        self
    }
}

/// A mock provider that replays queued responses in order. Once the queue is
/// empty the last behavior repeats, so breaker tests can fail indefinitely.
pub struct MockProvider {
    name: String,
    responses: Arc<Mutex<Vec<MockResponse>>>,
    /// All requests received, for assertions.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
    calls: AtomicU32,
    last_usage: Arc<Mutex<Option<TokenUsage>>>,
    /// Gap between streamed chunks.
    chunk_interval: Duration,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: Arc::new(Mutex::new(vec![])),
            requests: Arc::new(Mutex::new(vec![])),
            calls: AtomicU32::new(0),
            last_usage: Arc::new(Mutex::new(None)),
            chunk_interval: Duration::ZERO,
        }
    }

    /// Queue a simple text response.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().unwrap().push(MockResponse::text(text));
        self
    }

    /// Queue a provider error with an HTTP status.
    pub fn with_status_error(self, status: u16, message: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push(MockResponse::error(Some(status), message));
        self
    }

    pub fn with_mock_response(self, resp: MockResponse) -> Self {
        self.responses.lock().unwrap().push(resp);
        self
    }

    /// Gap inserted between streamed chunks.
    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.chunk_interval = interval;
        self
    }

    pub fn queue_response(&self, resp: MockResponse) {
        self.responses.lock().unwrap().push(resp);
    }

    /// Number of complete/stream calls received so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> MockResponse {
        let mut responses = self.responses.lock().unwrap();
        match responses.len() {
            0 => MockResponse::text("(mock: no queued response)"),
            1 => responses[0].clone(),
            _ => responses.remove(0),
        }
    }

    fn provider_error(&self, status: Option<u16>, message: String) -> ConductorError {
        ConductorError::Provider {
            provider: self.name.clone(),
            status,
            message,
            suggestion: None,
            request_id: None,
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming_supported: true,
            tools_supported: true,
            models: vec![
                ModelInfo {
                    id: "mock-model".into(),
                    display_name: "Mock Model".into(),
                    tier: ModelTier::Fast,
                    context_window: 200_000,
                    max_output_tokens: 8_192,
                    input_price_per_mtok: 1.00,
                    output_price_per_mtok: 2.00,
                    cache_write_price_per_mtok: 1.25,
                    cache_read_price_per_mtok: 0.10,
                    features: vec![],
                },
                ModelInfo {
                    id: "mock-model-xl".into(),
                    display_name: "Mock Model XL".into(),
                    tier: ModelTier::Strategic,
                    context_window: 200_000,
                    max_output_tokens: 16_384,
                    input_price_per_mtok: 5.00,
                    output_price_per_mtok: 10.00,
                    cache_write_price_per_mtok: 6.25,
                    cache_read_price_per_mtok: 0.50,
                    features: vec![],
                },
            ],
        }
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let mock = self.next_response();

        if !mock.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConductorError::Cancelled),
                _ = tokio::time::sleep(mock.delay) => {}
            }
        }

        if let Some((status, message)) = mock.error {
            return Err(self.provider_error(status, message));
        }

        *self.last_usage.lock().unwrap() = Some(mock.usage);

        Ok(Completion {
            content: mock.text,
            tool_calls: mock.tool_calls,
            finish_reason: mock.finish_reason,
            usage: mock.usage,
            model: self.resolve_model(&request.model),
            provider: self.name.clone(),
            request_id: format!("mock-{}", uuid::Uuid::new_v4()),
            created_at: Utc::now(),
        })
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let mock = self.next_response();

        if let Some((status, message)) = mock.error {
            return Err(self.provider_error(status, message));
        }

        *self.last_usage.lock().unwrap() = Some(mock.usage);

        let (tx, rx) = mpsc::channel(64);
        let request_id = format!("mock-{}", uuid::Uuid::new_v4());
        let interval = self.chunk_interval;
        let cancel = cancel.clone();
        let provider_name = self.name.clone();

        tokio::spawn(async move {
            for word in mock.text.split_whitespace() {
                if !interval.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                let chunk = StreamChunk {
                    request_id: request_id.clone(),
                    delta: StreamDelta::Text(format!("{word} ")),
                };
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
            let delta = match mock.stream_error {
                Some(message) => StreamDelta::Error(ConductorError::Provider {
                    provider: provider_name,
                    status: None,
                    message,
                    suggestion: None,
                    request_id: None,
                }),
                None => StreamDelta::Finish {
                    reason: mock.finish_reason,
                    usage: Some(mock.usage),
                },
            };
            let _ = tx.send(StreamChunk { request_id, delta }).await;
        });

        Ok(rx)
    }

    fn last_usage(&self) -> Option<TokenUsage> {
        *self.last_usage.lock().unwrap()
    }
}
