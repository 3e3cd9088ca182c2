//! End-to-end RPC tests: a real server on loopback driven through a
//! WebSocket client.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use conductor_core::{Frame, FrameType, TokenUsage};
use conductor_cost::{AuditLog, Authorizer, CostAccuracy, CostFilter, CostTracker, SqliteCostStore};
use conductor_llm::breaker::{CircuitBreaker, CircuitBreakerConfig};
use conductor_llm::failover::FailoverProvider;
use conductor_llm::mock::{MockProvider, MockResponse};
use conductor_llm::provider::Provider;
use conductor_llm::registry::ProviderRegistry;
use conductor_server::auth::{AUTH_HEADER, AuthConfig, TokenAuthenticator};
use conductor_server::costapi::CostApiState;
use conductor_server::llm::{LlmState, register_methods};
use conductor_server::metrics::Metrics;
use conductor_server::registry::HandlerRegistry;
use conductor_server::{RpcServer, ServerDeps};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Backend {
    server: Arc<RpcServer>,
    tracker: Arc<CostTracker>,
}

async fn start_backend(
    port_start: u16,
    port_end: u16,
    token: Option<&str>,
    mocks: Vec<Arc<MockProvider>>,
) -> Backend {
    let registry = Arc::new(ProviderRegistry::new());
    let mut order = Vec::new();
    for mock in &mocks {
        order.push(mock.name().to_string());
        registry.register(mock.clone()).unwrap();
    }
    registry.set_default(&order[0]).unwrap();
    registry.set_failover_order(order.clone()).unwrap();

    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        threshold: 5,
        recovery_timeout: Duration::from_secs(60),
    }));
    let chain = Arc::new(
        FailoverProvider::new(Arc::clone(&registry), order).with_breaker(Arc::clone(&breaker)),
    );

    let tracker = Arc::new(CostTracker::new());
    let handlers = Arc::new(HandlerRegistry::new());
    let metrics = Metrics::new();
    register_methods(
        &handlers,
        Arc::new(LlmState {
            chain,
            registry,
            breaker,
            tracker: Arc::clone(&tracker),
            metrics: metrics.clone(),
        }),
    );

    let authz = Authorizer::new();
    let cost_api = Arc::new(CostApiState {
        store: Arc::new(SqliteCostStore::open_in_memory().unwrap()),
        authz: Arc::new(authz),
        audit: Arc::new(AuditLog::new()),
    });

    let authenticator = token.map(|t| {
        Arc::new(TokenAuthenticator::new(
            t.to_string(),
            AuthConfig {
                window: Duration::from_secs(60),
                max_failures: 5,
                lockout: Duration::from_millis(300),
                sweep_interval: Duration::from_secs(60),
            },
        ))
    });

    let config = conductor_config::schema::ServerConfig {
        port_start,
        port_end,
        shutdown_timeout_secs: 5,
        auth_token: token.map(String::from),
    };

    let server = RpcServer::start(
        &config,
        ServerDeps {
            handlers,
            authenticator,
            cost_api,
            metrics,
        },
    )
    .await
    .unwrap();

    Backend {
        server: Arc::new(server),
        tracker,
    }
}

async fn connect(port: u16, token: Option<&str>) -> Result<WsClient, tungstenite::Error> {
    let mut request = format!("ws://127.0.0.1:{port}/ws")
        .into_client_request()
        .unwrap();
    if let Some(token) = token {
        request
            .headers_mut()
            .insert(AUTH_HEADER, token.parse().unwrap());
    }
    connect_async(request).await.map(|(ws, _)| ws)
}

fn connect_status(err: tungstenite::Error) -> u16 {
    match err {
        tungstenite::Error::Http(response) => response.status().as_u16(),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

async fn send_frame(ws: &mut WsClient, frame: &Frame) {
    ws.send(Message::Text(frame.encode().unwrap().into()))
        .await
        .unwrap();
}

/// Next protocol frame, skipping transport ping/pong noise.
async fn next_frame(ws: &mut WsClient) -> Frame {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .unwrap();
        match msg {
            Message::Text(text) => return Frame::decode(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

fn complete_params() -> serde_json::Value {
    json!({
        "provider": "default",
        "model": "fast",
        "messages": [{"role": "user", "content": "Hello"}],
        "metadata": {"runId": "run-1", "workflowId": "wf-1"},
    })
}

// ── Scenario: happy unary ──────────────────────────────────────

#[tokio::test]
async fn happy_unary_completion_with_cost_record() {
    let mock = Arc::new(MockProvider::new("mock").with_mock_response(
        MockResponse::text("ok").with_usage(TokenUsage::new(4, 1)),
    ));
    let backend = start_backend(19311, 19319, Some("sekrit"), vec![mock]).await;

    let mut ws = connect(backend.server.port(), Some("sekrit")).await.unwrap();
    send_frame(&mut ws, &Frame::request("c1", "llm.complete", Some(complete_params()))).await;

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.frame_type, FrameType::Response);
    assert_eq!(frame.correlation_id, "c1");
    let result = frame.result.unwrap();
    assert_eq!(result["content"], "ok");
    assert_eq!(result["model"], "mock-model");
    assert_eq!(result["usage"]["promptTokens"], 4);
    assert_eq!(result["usage"]["completionTokens"], 1);
    assert_eq!(result["usage"]["totalTokens"], 5);
    assert!(result["requestId"].is_string());

    // Exactly one cost record, measured, priced from the table.
    let records = backend.tracker.records(&CostFilter::default());
    assert_eq!(records.len(), 1);
    let cost = records[0].cost.as_ref().unwrap();
    assert_eq!(cost.accuracy, CostAccuracy::Measured);
    let expected = (4.0 * 1.0 + 1.0 * 2.0) / 1_000_000.0;
    assert!((cost.amount - expected).abs() < 1e-12);
    assert_eq!(records[0].run_id.as_deref(), Some("run-1"));

    backend.server.shutdown().await.unwrap();
}

// ── Scenario: failover on 503 ──────────────────────────────────

#[tokio::test]
async fn failover_reaches_fallback_provider() {
    let p1 = Arc::new(MockProvider::new("p1").with_status_error(503, "unavailable"));
    let p2 = Arc::new(MockProvider::new("p2").with_response("fallback"));
    let backend = start_backend(19321, 19329, None, vec![p1.clone(), p2.clone()]).await;

    let mut ws = connect(backend.server.port(), None).await.unwrap();
    send_frame(&mut ws, &Frame::request("c2", "llm.complete", Some(complete_params()))).await;

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.frame_type, FrameType::Response);
    assert_eq!(frame.result.unwrap()["content"], "fallback");
    assert_eq!(p1.call_count(), 1);
    assert_eq!(p2.call_count(), 1);

    backend.server.shutdown().await.unwrap();
}

// ── Scenario: rate-limit lockout ───────────────────────────────

#[tokio::test]
async fn wrong_token_locks_out_then_recovers() {
    let mock = Arc::new(MockProvider::new("mock").with_response("ok"));
    let backend = start_backend(19331, 19339, Some("right-token"), vec![mock]).await;
    let port = backend.server.port();

    for _ in 0..5 {
        let status = connect_status(connect(port, Some("wrong")).await.unwrap_err());
        assert_eq!(status, 401);
    }
    // Threshold crossed: wrong and right tokens both rate limited.
    let status = connect_status(connect(port, Some("wrong")).await.unwrap_err());
    assert_eq!(status, 429);
    let status = connect_status(connect(port, Some("right-token")).await.unwrap_err());
    assert_eq!(status, 429);

    // After the lockout elapses the correct token connects.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(connect(port, Some("right-token")).await.is_ok());

    backend.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let mock = Arc::new(MockProvider::new("mock").with_response("ok"));
    let backend = start_backend(19341, 19349, Some("tok"), vec![mock]).await;

    let status = connect_status(connect(backend.server.port(), None).await.unwrap_err());
    assert_eq!(status, 401);

    backend.server.shutdown().await.unwrap();
}

// ── Dispatch errors ────────────────────────────────────────────

#[tokio::test]
async fn unknown_method_yields_error_frame() {
    let mock = Arc::new(MockProvider::new("mock").with_response("ok"));
    let backend = start_backend(19351, 19359, None, vec![mock]).await;

    let mut ws = connect(backend.server.port(), None).await.unwrap();
    send_frame(&mut ws, &Frame::request("c3", "llm.telepathy", None)).await;

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(frame.correlation_id, "c3");
    assert_eq!(frame.error.unwrap().code, "method_not_found");

    backend.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_params_yield_validation_error() {
    let mock = Arc::new(MockProvider::new("mock").with_response("ok"));
    let backend = start_backend(19361, 19369, None, vec![mock]).await;

    let mut ws = connect(backend.server.port(), None).await.unwrap();
    let params = json!({"model": "fast", "messages": [], "surprise": true});
    send_frame(&mut ws, &Frame::request("c4", "llm.complete", Some(params))).await;

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(frame.error.unwrap().code, "validation_failed");

    backend.server.shutdown().await.unwrap();
}

// ── Catalog methods ────────────────────────────────────────────

#[tokio::test]
async fn models_and_providers_listings() {
    let mock = Arc::new(MockProvider::new("mock").with_response("ok"));
    let backend = start_backend(19301, 19309, None, vec![mock]).await;

    let mut ws = connect(backend.server.port(), None).await.unwrap();
    send_frame(&mut ws, &Frame::request("m1", "llm.models", None)).await;
    let frame = next_frame(&mut ws).await;
    let models = frame.result.unwrap()["models"].as_array().unwrap().clone();
    assert_eq!(models.len(), 2);
    assert!(models.iter().any(|m| m["id"] == "mock-model" && m["tier"] == "fast"));
    assert!(models.iter().all(|m| m["provider"] == "mock"));

    send_frame(&mut ws, &Frame::request("m2", "llm.providers", None)).await;
    let frame = next_frame(&mut ws).await;
    let result = frame.result.unwrap();
    assert_eq!(result["providers"][0], "mock");
    assert_eq!(result["default"], "mock");
    assert_eq!(result["failoverOrder"][0], "mock");

    backend.server.shutdown().await.unwrap();
}

// ── Handshake ──────────────────────────────────────────────────

#[tokio::test]
async fn handshake_negotiates_version() {
    let mock = Arc::new(MockProvider::new("mock").with_response("ok"));
    let backend = start_backend(19371, 19379, None, vec![mock]).await;

    let mut ws = connect(backend.server.port(), None).await.unwrap();
    send_frame(&mut ws, &Frame::handshake("h1", "1")).await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.frame_type, FrameType::Handshake);
    assert_eq!(frame.version.as_deref(), Some("1"));

    send_frame(&mut ws, &Frame::handshake("h2", "99")).await;
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame.frame_type, FrameType::Error);
    assert_eq!(frame.error.unwrap().code, "unsupported_version");

    backend.server.shutdown().await.unwrap();
}

// ── Streaming ──────────────────────────────────────────────────

#[tokio::test]
async fn streaming_delivers_chunks_then_final_flag() {
    let mock = Arc::new(MockProvider::new("mock").with_mock_response(
        MockResponse::text("alpha beta gamma").with_usage(TokenUsage::new(3, 3)),
    ));
    let backend = start_backend(19381, 19389, None, vec![mock]).await;

    let mut ws = connect(backend.server.port(), None).await.unwrap();
    send_frame(&mut ws, &Frame::request("c5", "llm.stream", Some(complete_params()))).await;

    let mut text = String::new();
    let mut saw_finish = false;
    loop {
        let frame = next_frame(&mut ws).await;
        assert_eq!(frame.frame_type, FrameType::Stream);
        assert_eq!(frame.correlation_id, "c5");
        if frame.stream_done {
            assert!(frame.result.is_none());
            break;
        }
        let payload = frame.result.unwrap();
        if payload["delta"]["type"] == "text" {
            assert!(!saw_finish, "no chunk may follow the finish chunk");
            text.push_str(payload["delta"]["text"].as_str().unwrap());
        } else if payload["finishReason"].is_string() {
            assert!(!saw_finish);
            saw_finish = true;
            assert_eq!(payload["finishReason"], "stop");
            assert_eq!(payload["usage"]["totalTokens"], 6);
        }
    }
    assert!(saw_finish);
    assert_eq!(text.trim(), "alpha beta gamma");

    // Streamed calls are recorded too.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.tracker.len(), 1);

    backend.server.shutdown().await.unwrap();
}

#[tokio::test]
async fn in_band_stream_error_arrives_as_final_chunk() {
    let mock = Arc::new(MockProvider::new("mock").with_mock_response(
        MockResponse::text("partial output").with_stream_error("upstream hiccup"),
    ));
    let backend = start_backend(19401, 19409, None, vec![mock]).await;

    let mut ws = connect(backend.server.port(), None).await.unwrap();
    send_frame(&mut ws, &Frame::request("c7", "llm.stream", Some(complete_params()))).await;

    let mut saw_error = false;
    loop {
        let frame = next_frame(&mut ws).await;
        assert_eq!(frame.frame_type, FrameType::Stream);
        if frame.stream_done {
            break;
        }
        let payload = frame.result.unwrap();
        if payload["error"].is_object() {
            assert!(!saw_error);
            saw_error = true;
            assert_eq!(payload["error"]["code"], "provider_error");
            assert!(
                payload["error"]["message"]
                    .as_str()
                    .unwrap()
                    .contains("upstream hiccup")
            );
        }
    }
    assert!(saw_error, "expected an in-band error chunk before the final flag");

    backend.server.shutdown().await.unwrap();
}

// ── Scenario: graceful shutdown while streaming ────────────────

async fn raw_health_status(port: u16) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: conductor\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn graceful_shutdown_closes_streaming_session() {
    let mock = Arc::new(
        MockProvider::new("mock")
            .with_mock_response(MockResponse::text(
                "one two three four five six seven eight nine ten",
            ))
            .with_chunk_interval(Duration::from_millis(50)),
    );
    let backend = start_backend(19391, 19399, None, vec![mock]).await;
    let port = backend.server.port();

    assert!(raw_health_status(port).await.contains("200"));

    let mut ws = connect(port, None).await.unwrap();
    send_frame(&mut ws, &Frame::request("c6", "llm.stream", Some(complete_params()))).await;

    // Two chunks arrive, then the operator pulls the plug.
    for _ in 0..2 {
        let frame = next_frame(&mut ws).await;
        assert_eq!(frame.frame_type, FrameType::Stream);
    }
    let server = Arc::clone(&backend.server);
    let shutdown = tokio::spawn(async move { server.shutdown().await });

    // While the session drains, the liveness endpoint reports 503.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(raw_health_status(port).await.contains("503"));

    // The client observes a Going-Away close within the shutdown deadline.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    let mut closed = false;
    while let Ok(Some(Ok(msg))) =
        tokio::time::timeout_at(deadline, ws.next()).await
    {
        if let Message::Close(frame) = msg {
            if let Some(frame) = frame {
                assert_eq!(u16::from(frame.code), 1001);
            }
            closed = true;
            break;
        }
    }
    assert!(closed, "expected a close frame before the deadline");

    shutdown.await.unwrap().unwrap();

    // Shutdown is not repeatable.
    assert!(matches!(
        backend.server.shutdown().await,
        Err(conductor_core::ConductorError::ServerClosed)
    ));
}
