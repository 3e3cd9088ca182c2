use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use conductor_core::{Capabilities, ConductorError, Result};

use crate::breaker::CircuitBreaker;
use crate::provider::{Completion, CompletionRequest, Provider, StreamChunk};
use crate::registry::ProviderRegistry;

/// Notified when the chain moves from one provider to the next.
/// Invocations are synchronous and must not block the next attempt.
pub trait FailoverObserver: Send + Sync {
    fn on_failover(&self, from: &str, to: &str, cause: &ConductorError);
}

/// Whether an error justifies skipping to the next provider in the chain:
/// 5xx / 408 / 429 provider errors, typed timeouts, an open circuit, and
/// transport errors that self-identify as transient. Auth failures (401/403),
/// explicit bad requests, validation errors, and cancellation all stop the
/// chain immediately.
pub fn is_failover_worthy(err: &ConductorError) -> bool {
    match err {
        ConductorError::Provider {
            status: Some(s), ..
        } => *s >= 500 || *s == 408 || *s == 429,
        ConductorError::Provider {
            status: None,
            message,
            ..
        } => {
            let m = message.to_ascii_lowercase();
            m.contains("timed out") || m.contains("temporar") || m.contains("connection")
        }
        ConductorError::Timeout { .. } => true,
        ConductorError::CircuitOpen(_) => true,
        ConductorError::RetriesExhausted { source, .. } => is_failover_worthy(source),
        _ => false,
    }
}

/// Ordered provider chain with a per-provider circuit breaker.
///
/// Providers are resolved by name through the registry at call time, so the
/// chain picks up re-registrations without being rebuilt.
pub struct FailoverProvider {
    registry: Arc<ProviderRegistry>,
    order: Vec<String>,
    breaker: Option<Arc<CircuitBreaker>>,
    observer: Option<Arc<dyn FailoverObserver>>,
}

impl FailoverProvider {
    pub fn new(registry: Arc<ProviderRegistry>, order: Vec<String>) -> Self {
        Self {
            registry,
            order,
            breaker: None,
            observer: None,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn FailoverObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    async fn try_chain<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut(Arc<dyn Provider>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempted: Vec<String> = Vec::new();
        let mut last_err: Option<ConductorError> = None;

        for (i, name) in self.order.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ConductorError::Cancelled);
            }
            if let Some(ref breaker) = self.breaker
                && !breaker.allow_request(name)
            {
                last_err = Some(ConductorError::CircuitOpen(name.clone()));
                continue;
            }
            let Some(provider) = self.registry.get(name) else {
                last_err = Some(ConductorError::Provider {
                    provider: name.clone(),
                    status: None,
                    message: "provider not registered".into(),
                    suggestion: None,
                    request_id: None,
                });
                continue;
            };

            attempted.push(name.clone());
            match call(provider).await {
                Ok(value) => {
                    if let Some(ref breaker) = self.breaker {
                        breaker.record_success(name);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if let Some(ref breaker) = self.breaker {
                        breaker.record_failure(name);
                    }
                    if !is_failover_worthy(&err) {
                        return Err(err);
                    }
                    if let Some(next) = self.order.get(i + 1) {
                        warn!(from = %name, to = %next, error = %err, "failing over");
                        if let Some(ref observer) = self.observer {
                            observer.on_failover(name, next, &err);
                        }
                    }
                    last_err = Some(err);
                }
            }
        }

        Err(ConductorError::FailoverExhausted {
            attempted,
            source: Box::new(last_err.unwrap_or_else(|| {
                ConductorError::Validation("failover order is empty".into())
            })),
        })
    }
}

#[async_trait]
impl Provider for FailoverProvider {
    fn name(&self) -> &str {
        "failover"
    }

    /// Union of the chained providers' catalogs.
    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::default();
        for name in &self.order {
            if let Some(p) = self.registry.get(name) {
                let c = p.capabilities();
                caps.streaming_supported |= c.streaming_supported;
                caps.tools_supported |= c.tools_supported;
                caps.models.extend(c.models);
            }
        }
        caps
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion> {
        self.try_chain(cancel, |p| {
            let cancel = cancel.clone();
            let request = request.clone();
            async move { p.complete(&request, &cancel).await }
        })
        .await
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>> {
        // Failover applies at sequence acquisition only; in-band stream
        // errors are terminal for the chain.
        self.try_chain(cancel, |p| {
            let cancel = cancel.clone();
            let request = request.clone();
            async move { p.stream(&request, &cancel).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn provider_err(status: u16) -> ConductorError {
        ConductorError::Provider {
            provider: "p".into(),
            status: Some(status),
            message: "x".into(),
            suggestion: None,
            request_id: None,
        }
    }

    #[test]
    fn worthy_on_5xx_408_429() {
        assert!(is_failover_worthy(&provider_err(500)));
        assert!(is_failover_worthy(&provider_err(503)));
        assert!(is_failover_worthy(&provider_err(408)));
        assert!(is_failover_worthy(&provider_err(429)));
    }

    #[test]
    fn not_worthy_on_auth_and_bad_request() {
        assert!(!is_failover_worthy(&provider_err(401)));
        assert!(!is_failover_worthy(&provider_err(403)));
        assert!(!is_failover_worthy(&provider_err(400)));
        assert!(!is_failover_worthy(&ConductorError::Validation("v".into())));
        assert!(!is_failover_worthy(&ConductorError::Cancelled));
    }

    #[test]
    fn worthy_on_timeout_and_circuit_open() {
        assert!(is_failover_worthy(&ConductorError::Timeout {
            timeout: Duration::from_secs(1)
        }));
        assert!(is_failover_worthy(&ConductorError::CircuitOpen("p".into())));
    }

    #[test]
    fn worthy_unwraps_retries_exhausted() {
        let wrapped = ConductorError::RetriesExhausted {
            provider: "p".into(),
            attempts: 3,
            source: Box::new(provider_err(503)),
        };
        assert!(is_failover_worthy(&wrapped));

        let not_wrapped = ConductorError::RetriesExhausted {
            provider: "p".into(),
            attempts: 3,
            source: Box::new(provider_err(401)),
        };
        assert!(!is_failover_worthy(&not_wrapped));
    }
}
