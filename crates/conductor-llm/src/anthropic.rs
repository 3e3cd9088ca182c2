use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use conductor_core::{
    Capabilities, ChatRole, ConductorError, FinishReason, ModelInfo, ModelTier, Result,
    TokenUsage, ToolInvocation, sanitize_provider_message,
};

use crate::provider::{Completion, CompletionRequest, Provider, StreamChunk, StreamDelta};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.into(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    fn build_request_body(&self, request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut messages = Vec::new();
        for msg in &request.messages {
            let role = match msg.role {
                // System turns ride the top-level system field.
                ChatRole::System => continue,
                ChatRole::User | ChatRole::Tool => "user",
                ChatRole::Assistant => "assistant",
            };
            messages.push(serde_json::json!({
                "role": role,
                "content": msg.content,
            }));
        }

        let mut body = serde_json::json!({
            "model": self.resolve_model(&request.model),
            "max_tokens": request.max_tokens.unwrap_or(4096),
            "messages": messages,
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(ref system) = request.system {
            body["system"] = serde_json::json!(system);
        } else if let Some(sys) = request
            .messages
            .iter()
            .find(|m| m.role == ChatRole::System)
        {
            body["system"] = serde_json::json!(sys.content);
        }
        if !request.stop.is_empty() {
            body["stop_sequences"] = serde_json::json!(request.stop);
        }
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }
        if stream {
            body["stream"] = serde_json::json!(true);
        }
        body
    }

    async fn post(
        &self,
        body: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        let send = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConductorError::Cancelled),
            result = send => result.map_err(|e| self.transport_error(e))?,
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ConductorError::Provider {
                provider: "anthropic".into(),
                status: Some(status.as_u16()),
                message: sanitize_provider_message(&text),
                suggestion: suggestion_for_status(status.as_u16()),
                request_id: None,
            });
        }
        Ok(response)
    }

    fn transport_error(&self, err: reqwest::Error) -> ConductorError {
        if err.is_timeout() {
            return ConductorError::Timeout {
                timeout: std::time::Duration::ZERO,
            };
        }
        ConductorError::Provider {
            provider: "anthropic".into(),
            status: None,
            message: sanitize_provider_message(&err.to_string()),
            suggestion: None,
            request_id: None,
        }
    }
}

fn suggestion_for_status(status: u16) -> Option<String> {
    match status {
        401 | 403 => Some("check the configured Anthropic API key".into()),
        429 => Some("reduce request rate or raise the account limit".into()),
        529 => Some("the API is overloaded; retry later".into()),
        _ => None,
    }
}

fn map_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn parse_usage(value: &serde_json::Value) -> TokenUsage {
    TokenUsage::new(
        value["input_tokens"].as_u64().unwrap_or(0),
        value["output_tokens"].as_u64().unwrap_or(0),
    )
    .with_cache(
        value["cache_creation_input_tokens"].as_u64().unwrap_or(0),
        value["cache_read_input_tokens"].as_u64().unwrap_or(0),
    )
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming_supported: true,
            tools_supported: true,
            models: vec![
                ModelInfo {
                    id: "claude-haiku-3-5".into(),
                    display_name: "Claude Haiku 3.5".into(),
                    tier: ModelTier::Fast,
                    context_window: 200_000,
                    max_output_tokens: 8_192,
                    input_price_per_mtok: 0.80,
                    output_price_per_mtok: 4.00,
                    cache_write_price_per_mtok: 1.00,
                    cache_read_price_per_mtok: 0.08,
                    features: vec!["tools".into()],
                },
                ModelInfo {
                    id: "claude-sonnet-4-20250514".into(),
                    display_name: "Claude Sonnet 4".into(),
                    tier: ModelTier::Balanced,
                    context_window: 200_000,
                    max_output_tokens: 64_000,
                    input_price_per_mtok: 3.00,
                    output_price_per_mtok: 15.00,
                    cache_write_price_per_mtok: 3.75,
                    cache_read_price_per_mtok: 0.30,
                    features: vec!["tools".into(), "thinking".into()],
                },
                ModelInfo {
                    id: "claude-opus-4-20250514".into(),
                    display_name: "Claude Opus 4".into(),
                    tier: ModelTier::Strategic,
                    context_window: 200_000,
                    max_output_tokens: 32_000,
                    input_price_per_mtok: 15.00,
                    output_price_per_mtok: 75.00,
                    cache_write_price_per_mtok: 18.75,
                    cache_read_price_per_mtok: 1.50,
                    features: vec!["tools".into(), "thinking".into()],
                },
            ],
        }
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        let body = self.build_request_body(request, false);
        debug!(model = %request.model, "sending Anthropic completion request");
        let response = self.post(body, cancel).await?;

        let data: serde_json::Value = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConductorError::Cancelled),
            result = response.json() => result.map_err(|e| self.transport_error(e))?,
        };

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        if let Some(blocks) = data["content"].as_array() {
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => content.push_str(block["text"].as_str().unwrap_or("")),
                    Some("tool_use") => tool_calls.push(ToolInvocation {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        arguments: block["input"].clone(),
                    }),
                    _ => {}
                }
            }
        }

        Ok(Completion {
            content,
            tool_calls,
            finish_reason: map_stop_reason(data["stop_reason"].as_str()),
            usage: parse_usage(&data["usage"]),
            model: data["model"]
                .as_str()
                .unwrap_or(&request.model)
                .to_string(),
            provider: "anthropic".into(),
            request_id: data["id"].as_str().unwrap_or("").to_string(),
            created_at: Utc::now(),
        })
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<StreamChunk>> {
        let body = self.build_request_body(request, true);
        debug!(model = %request.model, "opening Anthropic stream");
        let response = self.post(body, cancel).await?;

        let (tx, rx) = mpsc::channel(64);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut request_id = String::new();
            let mut usage = TokenUsage::default();
            let mut finish = FinishReason::Stop;
            let mut tool_index: u32 = 0;

            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = byte_stream.next() => item,
                };
                let Some(item) = item else { break };
                let bytes = match item {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(StreamChunk {
                                request_id: request_id.clone(),
                                delta: StreamDelta::Error(ConductorError::Provider {
                                    provider: "anthropic".into(),
                                    status: None,
                                    message: sanitize_provider_message(&e.to_string()),
                                    suggestion: None,
                                    request_id: None,
                                }),
                            })
                            .await;
                        // Terminal: the channel closes when the task ends.
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(payload) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let Ok(event) = serde_json::from_str::<serde_json::Value>(payload) else {
                        continue;
                    };
                    match event["type"].as_str() {
                        Some("message_start") => {
                            request_id = event["message"]["id"]
                                .as_str()
                                .unwrap_or("")
                                .to_string();
                            usage.merge(&parse_usage(&event["message"]["usage"]));
                        }
                        Some("content_block_start") => {
                            if event["content_block"]["type"].as_str() == Some("tool_use") {
                                let call = ToolInvocation {
                                    id: event["content_block"]["id"]
                                        .as_str()
                                        .unwrap_or("")
                                        .to_string(),
                                    name: event["content_block"]["name"]
                                        .as_str()
                                        .unwrap_or("")
                                        .to_string(),
                                    arguments: serde_json::Value::Null,
                                };
                                let chunk = StreamChunk {
                                    request_id: request_id.clone(),
                                    delta: StreamDelta::ToolCall {
                                        index: tool_index,
                                        call,
                                    },
                                };
                                tool_index += 1;
                                if tx.send(chunk).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some("content_block_delta") => {
                            if let Some(text) = event["delta"]["text"].as_str()
                                && !text.is_empty()
                            {
                                let chunk = StreamChunk {
                                    request_id: request_id.clone(),
                                    delta: StreamDelta::Text(text.to_string()),
                                };
                                if tx.send(chunk).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Some("message_delta") => {
                            finish = map_stop_reason(event["delta"]["stop_reason"].as_str());
                            usage.merge(&parse_usage(&event["usage"]));
                        }
                        Some("message_stop") => {
                            let _ = tx
                                .send(StreamChunk {
                                    request_id: request_id.clone(),
                                    delta: StreamDelta::Finish {
                                        reason: finish,
                                        usage: Some(usage),
                                    },
                                })
                                .await;
                            return;
                        }
                        _ => {}
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::ChatMessage;

    #[test]
    fn body_includes_system_and_stop() {
        let provider = AnthropicProvider::new("k".into());
        let request = CompletionRequest {
            model: "balanced".into(),
            messages: vec![ChatMessage::user("hi")],
            system: Some("be terse".into()),
            stop: vec!["END".into()],
            ..Default::default()
        };
        let body = provider.build_request_body(&request, false);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["stop_sequences"][0], "END");
        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn tier_resolution_uses_catalog() {
        let provider = AnthropicProvider::new("k".into());
        assert_eq!(provider.resolve_model("fast"), "claude-haiku-3-5");
        assert_eq!(provider.resolve_model("strategic"), "claude-opus-4-20250514");
        assert_eq!(provider.resolve_model("claude-x"), "claude-x");
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(map_stop_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(map_stop_reason(Some("tool_use")), FinishReason::ToolCalls);
    }

    #[test]
    fn usage_parse_includes_cache_fields() {
        let value = serde_json::json!({
            "input_tokens": 10,
            "output_tokens": 5,
            "cache_creation_input_tokens": 3,
            "cache_read_input_tokens": 7,
        });
        let usage = parse_usage(&value);
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(usage.cache_creation_tokens, 3);
        assert_eq!(usage.cache_read_tokens, 7);
    }
}
