//! # conductor-llm
//!
//! The provider invocation pipeline: a uniform completion/streaming contract
//! over upstream LLM providers, composed with exponential-backoff retry, a
//! per-provider circuit breaker, and ordered failover. Also home to the
//! model pricing table and the named provider registry.

pub mod anthropic;
pub mod breaker;
pub mod failover;
pub mod mock;
pub mod pricing;
pub mod provider;
pub mod registry;
pub mod retry;

pub use breaker::{BreakerStatus, CircuitBreaker, CircuitBreakerConfig};
pub use failover::{FailoverObserver, FailoverProvider, is_failover_worthy};
pub use provider::{
    Completion, CompletionRequest, Provider, RequestMetadata, StreamChunk, StreamDelta,
};
pub use registry::{Credentials, ProviderRegistry};
pub use retry::{RetryPolicy, RetryProvider, default_retry_classifier};
