//! RPC method handlers for LLM traffic: `llm.complete`, `llm.stream`,
//! `llm.models`, and `llm.providers`. Handlers close over the provider chain
//! chosen at construction time and append a cost record for every provider
//! call they complete.

use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use conductor_core::{
    ChatMessage, ConductorError, Result, TokenUsage, ToolDefinition,
};
use conductor_cost::{CostAmount, CostRecord, CostTracker};
use conductor_llm::breaker::CircuitBreaker;
use conductor_llm::pricing;
use conductor_llm::provider::{
    Completion, CompletionRequest, Provider, RequestMetadata, StreamDelta,
};
use conductor_llm::registry::ProviderRegistry;

use crate::metrics::Metrics;
use crate::registry::{HandlerContext, HandlerRegistry};
use crate::stream::StreamWriter;

/// Shared dependencies of the LLM method handlers.
pub struct LlmState {
    /// Default invocation pipeline (failover over retry-wrapped providers).
    pub chain: Arc<dyn Provider>,
    pub registry: Arc<ProviderRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub tracker: Arc<CostTracker>,
    pub metrics: Metrics,
}

/// Wire shape of `llm.complete` / `llm.stream` params. Unknown fields are
/// rejected.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CompleteParams {
    #[serde(default)]
    provider: Option<String>,
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    tools: Vec<ToolDefinition>,
    #[serde(default)]
    stop: Vec<String>,
    #[serde(default)]
    metadata: RequestMetadata,
}

impl CompleteParams {
    fn parse(params: Value) -> Result<Self> {
        serde_json::from_value(params).map_err(|e| ConductorError::Validation(e.to_string()))
    }

    fn into_request(self) -> (Option<String>, CompletionRequest) {
        let provider = self.provider;
        let request = CompletionRequest {
            model: self.model,
            messages: self.messages,
            system: self.system,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: self.tools,
            stop: self.stop,
            metadata: self.metadata,
        };
        (provider, request)
    }
}

/// Register the llm.* methods.
pub fn register_methods(handlers: &HandlerRegistry, state: Arc<LlmState>) {
    {
        let state = Arc::clone(&state);
        handlers.register_unary(
            "llm.complete",
            Arc::new(move |ctx, params| {
                let state = Arc::clone(&state);
                Box::pin(async move { complete_handler(state, ctx, params).await })
            }),
        );
    }
    {
        let state = Arc::clone(&state);
        handlers.register_stream(
            "llm.stream",
            Arc::new(move |ctx, params, writer| {
                let state = Arc::clone(&state);
                Box::pin(async move { stream_handler(state, ctx, params, writer).await })
            }),
        );
    }
    {
        let state = Arc::clone(&state);
        handlers.register_unary(
            "llm.models",
            Arc::new(move |_ctx, _params| {
                let state = Arc::clone(&state);
                Box::pin(async move { models_handler(state) })
            }),
        );
    }
    handlers.register_unary(
        "llm.providers",
        Arc::new(move |_ctx, _params| {
            let state = Arc::clone(&state);
            Box::pin(async move { providers_handler(state) })
        }),
    );
}

fn select_provider(state: &LlmState, name: Option<&str>) -> Result<Arc<dyn Provider>> {
    match name {
        None | Some("default") => Ok(Arc::clone(&state.chain)),
        Some(name) => state
            .registry
            .get(name)
            .ok_or_else(|| ConductorError::Validation(format!("unknown provider: {name}"))),
    }
}

/// Pick the usage to account for and whether the provider reported it.
fn settle_usage(
    reported: TokenUsage,
    provider: &dyn Provider,
    request: &CompletionRequest,
    content_len: usize,
) -> (TokenUsage, bool) {
    if reported.total_tokens > 0 {
        return (reported, true);
    }
    if let Some(usage) = provider.last_usage()
        && usage.total_tokens > 0
    {
        return (usage.normalized(), true);
    }
    let prompt_chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
    let prompt = pricing::estimate_tokens_from_chars(prompt_chars);
    let completion = pricing::estimate_tokens_from_chars(content_len);
    (TokenUsage::new(prompt, completion), false)
}

fn build_cost_record(
    request: &CompletionRequest,
    requested_provider: Option<&str>,
    actual_provider: &str,
    model: &str,
    request_id: &str,
    usage: TokenUsage,
    usage_reported: bool,
    duration_ms: u64,
) -> CostRecord {
    let amount = pricing::compute_cost(model, &usage);
    let cost = amount.map(|a| {
        if usage_reported {
            CostAmount::measured(a, "pricing-table")
        } else {
            CostAmount::estimated(a, "pricing-table")
        }
    });
    let provider = match requested_provider {
        Some(p) if p != "default" => p.to_string(),
        _ => actual_provider.to_string(),
    };
    CostRecord {
        id: uuid::Uuid::new_v4().to_string(),
        request_id: request_id.to_string(),
        run_id: request.metadata.run_id.clone(),
        step_name: request.metadata.step_name.clone(),
        workflow_id: request.metadata.workflow_id.clone(),
        user_id: request.metadata.user_id.clone(),
        provider,
        model: model.to_string(),
        actual_provider: actual_provider.to_string(),
        timestamp: chrono::Utc::now(),
        duration_ms,
        usage,
        cost,
    }
}

async fn complete_handler(
    state: Arc<LlmState>,
    ctx: HandlerContext,
    params: Value,
) -> Result<Value> {
    let (provider_name, request) = CompleteParams::parse(params)?.into_request();
    request.validate()?;
    let provider = select_provider(&state, provider_name.as_deref())?;

    let started = Instant::now();
    let completion = provider.complete(&request, &ctx.cancel).await?;
    let duration_ms = started.elapsed().as_millis() as u64;

    let (usage, reported) = settle_usage(
        completion.usage,
        provider.as_ref(),
        &request,
        completion.content.len(),
    );
    let record = build_cost_record(
        &request,
        provider_name.as_deref(),
        &completion.provider,
        &completion.model,
        &completion.request_id,
        usage,
        reported,
        duration_ms,
    );
    state
        .metrics
        .record_llm_call(usage.prompt_tokens, usage.completion_tokens, record.cost.as_ref().map(|c| c.amount));
    state.tracker.track(record);
    debug!(
        model = %completion.model,
        provider = %completion.provider,
        duration_ms,
        "completion served"
    );

    let completion = Completion { usage, ..completion };
    Ok(serde_json::to_value(&completion)?)
}

async fn stream_handler(
    state: Arc<LlmState>,
    ctx: HandlerContext,
    params: Value,
    writer: StreamWriter,
) -> Result<()> {
    let (provider_name, request) = CompleteParams::parse(params)?.into_request();
    request.validate()?;
    let provider = select_provider(&state, provider_name.as_deref())?;

    let started = Instant::now();
    let mut rx = provider.stream(&request, &ctx.cancel).await?;

    let mut content_len = 0usize;
    let mut final_usage: Option<TokenUsage> = None;
    let mut request_id = String::new();

    // Transport failures must not short-circuit cost accounting: the
    // provider consumed billable tokens whether or not the client is still
    // listening.
    let mut transport: Result<()> = Ok(());
    loop {
        let chunk = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(c) => c,
                None => break,
            },
        };
        request_id = chunk.request_id.clone();
        let (payload, terminal) = match chunk.delta {
            StreamDelta::Text(text) => {
                content_len += text.len();
                (
                    json!({
                        "requestId": chunk.request_id,
                        "delta": {"type": "text", "text": text},
                    }),
                    false,
                )
            }
            StreamDelta::ToolCall { index, call } => (
                json!({
                    "requestId": chunk.request_id,
                    "delta": {"type": "toolCall", "index": index, "toolCall": call},
                }),
                false,
            ),
            StreamDelta::Finish { reason, usage } => {
                final_usage = usage;
                (
                    json!({
                        "requestId": chunk.request_id,
                        "finishReason": reason.as_str(),
                        "usage": usage,
                    }),
                    true,
                )
            }
            // In-band provider errors travel as a final chunk carrying an
            // error field, not as a separate Error frame.
            StreamDelta::Error(err) => (
                json!({
                    "requestId": chunk.request_id,
                    "error": {"code": err.code(), "message": err.to_string()},
                }),
                true,
            ),
        };
        if let Err(e) = writer.send(payload).await {
            transport = Err(e);
            break;
        }
        if terminal {
            break;
        }
    }
    if transport.is_ok() {
        transport = writer.done().await;
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    let (usage, reported) = settle_usage(
        final_usage.unwrap_or_default(),
        provider.as_ref(),
        &request,
        content_len,
    );
    let model = provider.resolve_model(&request.model);
    let record = build_cost_record(
        &request,
        provider_name.as_deref(),
        provider.name(),
        &model,
        &request_id,
        usage,
        reported,
        duration_ms,
    );
    state
        .metrics
        .record_llm_call(usage.prompt_tokens, usage.completion_tokens, record.cost.as_ref().map(|c| c.amount));
    state.tracker.track(record);

    if let Err(e) = transport {
        // The session went away mid-stream; nobody is left to tell.
        debug!(error = %e, "stream transport closed before completion");
    }
    Ok(())
}

fn models_handler(state: Arc<LlmState>) -> Result<Value> {
    let mut models = Vec::new();
    for name in state.registry.names() {
        if let Some(provider) = state.registry.get(&name) {
            for model in provider.capabilities().models {
                let mut entry = serde_json::to_value(&model)?;
                entry["provider"] = json!(name);
                models.push(entry);
            }
        }
    }
    Ok(json!({"models": models}))
}

fn providers_handler(state: Arc<LlmState>) -> Result<Value> {
    Ok(json!({
        "providers": state.registry.names(),
        "default": state.registry.default_name(),
        "failoverOrder": state.registry.failover_order(),
        "circuitBreakers": state.breaker.status(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_reject_unknown_fields() {
        let raw = json!({
            "model": "fast",
            "messages": [{"role": "user", "content": "hi"}],
            "gpuCount": 8,
        });
        assert!(matches!(
            CompleteParams::parse(raw),
            Err(ConductorError::Validation(_))
        ));
    }

    #[test]
    fn params_parse_minimal() {
        let raw = json!({
            "model": "fast",
            "messages": [{"role": "user", "content": "Hello"}],
        });
        let (provider, request) = CompleteParams::parse(raw).unwrap().into_request();
        assert!(provider.is_none());
        assert_eq!(request.model, "fast");
        assert_eq!(request.messages.len(), 1);
    }

    #[test]
    fn params_carry_tracking_metadata() {
        let raw = json!({
            "provider": "default",
            "model": "fast",
            "messages": [{"role": "user", "content": "Hello"}],
            "metadata": {"runId": "r1", "workflowId": "wf1", "stepName": "draft"},
        });
        let (_, request) = CompleteParams::parse(raw).unwrap().into_request();
        assert_eq!(request.metadata.run_id.as_deref(), Some("r1"));
        assert_eq!(request.metadata.workflow_id.as_deref(), Some("wf1"));
    }
}
