use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use conductor_core::{
    Capabilities, ChatMessage, ConductorError, FinishReason, Result, TokenUsage, ToolDefinition,
    ToolInvocation,
};

/// Tracking metadata attached to a completion request for cost accounting.
/// Recognized fields only; unknown keys are rejected at the RPC boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A request to an LLM provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    /// Concrete model id or a tier name ("fast", "balanced", "strategic").
    pub model: String,
    /// Conversation history. Must be non-empty.
    pub messages: Vec<ChatMessage>,
    /// System prompt, separate from messages for providers that support it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

impl CompletionRequest {
    pub fn validate(&self) -> Result<()> {
        if self.messages.is_empty() {
            return Err(ConductorError::Validation(
                "completion request requires at least one message".into(),
            ));
        }
        if self.model.is_empty() {
            return Err(ConductorError::Validation("model must not be empty".into()));
        }
        Ok(())
    }
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
    /// The concrete model that served the request (tiers resolved).
    pub model: String,
    /// The provider that served the request; differs from the requested one
    /// when failover fired.
    pub provider: String,
    pub request_id: String,
    pub created_at: DateTime<Utc>,
}

/// One element of a streamed completion.
#[derive(Debug)]
pub struct StreamChunk {
    pub request_id: String,
    pub delta: StreamDelta,
}

/// The payload of a stream chunk. At most one terminal variant
/// ([`StreamDelta::Finish`] or [`StreamDelta::Error`]) is produced per
/// stream, and nothing follows it.
#[derive(Debug)]
pub enum StreamDelta {
    /// Incremental text fragment.
    Text(String),
    /// Partial tool call with its position in the final tool_calls array.
    ToolCall { index: u32, call: ToolInvocation },
    /// Final chunk, carrying the finish reason and usage when reported.
    Finish {
        reason: FinishReason,
        usage: Option<TokenUsage>,
    },
    /// Terminal in-band error.
    Error(ConductorError),
}

impl StreamDelta {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Error(_))
    }
}

/// Uniform contract over upstream LLM providers.
///
/// `stream` hands ownership of the sending half to the producer task: the
/// producer MUST close the channel on success and error paths alike, and
/// consumers should drain until the channel closes.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier, used as the registry / breaker / cost key.
    fn name(&self) -> &str;

    /// Model catalog and support flags.
    fn capabilities(&self) -> Capabilities;

    /// Send a non-streaming request.
    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion>;

    /// Send a streaming request. Returns the receiving half of the chunk
    /// channel; the producer owns termination.
    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>>;

    /// Token usage of the most recent request, for providers that can only
    /// publish usage after the fact.
    fn last_usage(&self) -> Option<TokenUsage> {
        None
    }

    /// Resolve a tier name to a concrete model id using this provider's
    /// catalog; anything that is not a tier passes through verbatim.
    fn resolve_model(&self, model: &str) -> String {
        match conductor_core::ModelTier::parse(model) {
            Some(tier) => self
                .capabilities()
                .models
                .iter()
                .find(|m| m.tier == tier)
                .map(|m| m.id.clone())
                .unwrap_or_else(|| model.to_string()),
            None => model.to_string(),
        }
    }
}
