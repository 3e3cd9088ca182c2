use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use conductor_core::{ConductorError, Result};

use crate::stream::StreamWriter;

/// Per-invocation context handed to method handlers.
#[derive(Clone)]
pub struct HandlerContext {
    pub session_id: String,
    pub correlation_id: String,
    /// Cancelled when the session drops or the server shuts down.
    pub cancel: CancellationToken,
}

pub type UnaryHandler =
    Arc<dyn Fn(HandlerContext, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

pub type StreamHandler = Arc<
    dyn Fn(HandlerContext, Value, StreamWriter) -> BoxFuture<'static, Result<()>> + Send + Sync,
>;

/// A resolved dispatch target.
#[derive(Clone)]
pub enum Dispatch {
    Unary(UnaryHandler),
    Stream(StreamHandler),
}

/// Method name → handler tables. Registration is concurrent-safe and
/// last-writer-wins per method.
#[derive(Default)]
pub struct HandlerRegistry {
    unary: RwLock<HashMap<String, UnaryHandler>>,
    stream: RwLock<HashMap<String, StreamHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_unary(&self, method: impl Into<String>, handler: UnaryHandler) {
        self.unary.write().insert(method.into(), handler);
    }

    pub fn register_stream(&self, method: impl Into<String>, handler: StreamHandler) {
        self.stream.write().insert(method.into(), handler);
    }

    /// Route by presence, preferring unary.
    pub fn dispatch(&self, method: &str) -> Result<Dispatch> {
        if let Some(h) = self.unary.read().get(method) {
            return Ok(Dispatch::Unary(Arc::clone(h)));
        }
        if let Some(h) = self.stream.read().get(method) {
            return Ok(Dispatch::Stream(Arc::clone(h)));
        }
        Err(ConductorError::MethodNotFound(method.to_string()))
    }

    /// Resolve a method for a caller that cannot stream.
    pub fn dispatch_unary(&self, method: &str) -> Result<UnaryHandler> {
        match self.dispatch(method)? {
            Dispatch::Unary(h) => Ok(h),
            Dispatch::Stream(_) => Err(ConductorError::RequiresStreaming(method.to_string())),
        }
    }

    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .unary
            .read()
            .keys()
            .chain(self.stream.read().keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> HandlerContext {
        HandlerContext {
            session_id: "s1".into(),
            correlation_id: "c1".into(),
            cancel: CancellationToken::new(),
        }
    }

    fn echo_handler() -> UnaryHandler {
        Arc::new(|_ctx, params| Box::pin(async move { Ok(params) }))
    }

    #[tokio::test]
    async fn dispatch_unary_handler() {
        let registry = HandlerRegistry::new();
        registry.register_unary("echo", echo_handler());

        let Dispatch::Unary(handler) = registry.dispatch("echo").unwrap() else {
            panic!("expected unary dispatch");
        };
        let out = handler(ctx(), serde_json::json!({"x": 1})).await.unwrap();
        assert_eq!(out["x"], 1);
    }

    #[test]
    fn unknown_method_not_found() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.dispatch("ghost"),
            Err(ConductorError::MethodNotFound(_))
        ));
    }

    #[test]
    fn stream_method_via_unary_requires_streaming() {
        let registry = HandlerRegistry::new();
        registry.register_stream(
            "tail",
            Arc::new(|_ctx, _params, _writer| Box::pin(async { Ok(()) })),
        );
        assert!(matches!(
            registry.dispatch_unary("tail"),
            Err(ConductorError::RequiresStreaming(_))
        ));
        assert!(matches!(registry.dispatch("tail"), Ok(Dispatch::Stream(_))));
    }

    #[tokio::test]
    async fn registration_is_last_writer_wins() {
        let registry = HandlerRegistry::new();
        registry.register_unary(
            "m",
            Arc::new(|_c, _p| Box::pin(async { Ok(serde_json::json!("first")) })),
        );
        registry.register_unary(
            "m",
            Arc::new(|_c, _p| Box::pin(async { Ok(serde_json::json!("second")) })),
        );
        let Dispatch::Unary(handler) = registry.dispatch("m").unwrap() else {
            panic!("expected unary dispatch");
        };
        assert_eq!(
            handler(ctx(), Value::Null).await.unwrap(),
            serde_json::json!("second")
        );
    }

    #[test]
    fn unary_preferred_over_stream() {
        let registry = HandlerRegistry::new();
        registry.register_stream(
            "both",
            Arc::new(|_c, _p, _w| Box::pin(async { Ok(()) })),
        );
        registry.register_unary("both", echo_handler());
        assert!(matches!(registry.dispatch("both"), Ok(Dispatch::Unary(_))));
    }
}
