use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use conductor_core::{Capabilities, ConductorError, Result, TokenUsage};

use crate::provider::{Completion, CompletionRequest, Provider, StreamChunk};

/// Shape of the exponential backoff applied between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Additional attempts after the first; 0 disables retrying.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor per attempt, must be > 1.
    pub multiplier: f64,
    /// Fraction of the backoff added/subtracted uniformly at random, in [0, 1].
    pub jitter: f64,
    /// Overall cap on one invocation including sleeps.
    pub absolute_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
            absolute_timeout: None,
        }
    }
}

pub type RetryClassifier = Arc<dyn Fn(&ConductorError) -> bool + Send + Sync>;

/// Default retryability rule: 5xx and 429 provider errors, typed timeouts,
/// and transport errors that self-identify as transient. Everything else —
/// other 4xx, auth failures, validation, cancellation — is returned as-is.
pub fn default_retry_classifier(err: &ConductorError) -> bool {
    match err {
        ConductorError::Provider {
            status: Some(s), ..
        } => *s >= 500 || *s == 429,
        ConductorError::Provider {
            status: None,
            message,
            ..
        } => {
            let m = message.to_ascii_lowercase();
            m.contains("timed out")
                || m.contains("temporar")
                || m.contains("connection reset")
                || m.contains("connection closed")
        }
        ConductorError::Timeout { .. } => true,
        _ => false,
    }
}

/// Wraps a provider with exponential-backoff-with-jitter retries.
///
/// Streams are retried only at acquisition time; once a chunk channel has
/// been handed to the caller, in-flight errors are not replayed.
pub struct RetryProvider {
    inner: Arc<dyn Provider>,
    policy: RetryPolicy,
    classifier: RetryClassifier,
}

impl RetryProvider {
    pub fn new(inner: Arc<dyn Provider>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            classifier: Arc::new(default_retry_classifier),
        }
    }

    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Backoff before retry number `attempt` (0-based): capped exponential
    /// growth plus a uniform jitter in `[-jitter*delay, +jitter*delay]`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.policy.initial_delay.as_secs_f64()
            * self.policy.multiplier.powi(attempt as i32);
        let capped = base.min(self.policy.max_delay.as_secs_f64());
        let spread = (rand::random::<f64>() * 2.0 - 1.0) * self.policy.jitter * capped;
        Duration::from_secs_f64((capped + spread).max(0.0))
    }

    async fn run_attempts<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = self
            .policy
            .absolute_timeout
            .map(|t| tokio::time::Instant::now() + t);

        let mut attempt = 0u32;
        loop {
            let call = attempt_fn();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConductorError::Cancelled),
                outcome = async {
                    match deadline {
                        Some(d) => tokio::time::timeout_at(d, call)
                            .await
                            .unwrap_or_else(|_| {
                                Err(ConductorError::Timeout {
                                    timeout: self.policy.absolute_timeout.unwrap_or_default(),
                                })
                            }),
                        None => call.await,
                    }
                } => outcome,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !(self.classifier)(&err) {
                        return Err(err);
                    }
                    // Past the absolute deadline every further attempt would
                    // time out immediately; surface the error as-is.
                    if let Some(d) = deadline
                        && tokio::time::Instant::now() >= d
                    {
                        return Err(err);
                    }
                    if attempt >= self.policy.max_retries {
                        return Err(ConductorError::RetriesExhausted {
                            provider: self.inner.name().to_string(),
                            attempts: attempt + 1,
                            source: Box::new(err),
                        });
                    }
                    let delay = self.backoff_delay(attempt);
                    attempt += 1;
                    warn!(
                        provider = self.inner.name(),
                        attempt,
                        max = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient error"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ConductorError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Provider for RetryProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        self.run_attempts(cancel, || self.inner.complete(request, cancel))
            .await
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>> {
        // Retry covers acquisition only; nothing is replayed once chunks flow.
        self.run_attempts(cancel, || self.inner.stream(request, cancel))
            .await
    }

    fn last_usage(&self) -> Option<TokenUsage> {
        self.inner.last_usage()
    }
}
