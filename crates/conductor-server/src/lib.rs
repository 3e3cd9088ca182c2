//! # conductor-server
//!
//! The RPC transport and session core of the Conductor backend:
//!
//! - WebSocket framed transport with token authentication and rate limiting
//! - Handler registry dispatching typed method handlers
//! - Per-session serialized writes with ping/pong liveness
//! - Liveness endpoint, Prometheus metrics, and the HTTP cost query surface
//! - Port-range binding with supervisor discovery on stdout

pub mod auth;
pub mod costapi;
pub mod llm;
pub mod metrics;
pub mod registry;
pub mod stream;

use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt, stream::SplitSink};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conductor_core::{ConductorError, Frame, FrameType, PROTOCOL_VERSION, Result};

use crate::auth::{AUTH_HEADER, AuthOutcome, TokenAuthenticator};
use crate::costapi::CostApiState;
use crate::metrics::Metrics;
use crate::registry::{Dispatch, HandlerContext, HandlerRegistry};
use crate::stream::{SessionHandle, StreamWriter};

const READ_DEADLINE: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const CLOSE_DEADLINE: Duration = Duration::from_secs(1);
/// WebSocket close code sent to sessions on shutdown.
const GOING_AWAY: u16 = 1001;

/// Everything the server needs injected at startup.
pub struct ServerDeps {
    pub handlers: Arc<HandlerRegistry>,
    pub authenticator: Option<Arc<TokenAuthenticator>>,
    pub cost_api: Arc<CostApiState>,
    pub metrics: Metrics,
}

struct AppState {
    handlers: Arc<HandlerRegistry>,
    authenticator: Option<Arc<TokenAuthenticator>>,
    metrics: Metrics,
    sessions: DashMap<String, CancellationToken>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// A running RPC server bound to one loopback port.
pub struct RpcServer {
    state: Arc<AppState>,
    port: u16,
    shutdown_timeout: Duration,
    /// Stops the HTTP listener; fired after sessions have drained so the
    /// liveness endpoint keeps answering 503 during the drain.
    stop: CancellationToken,
    serve_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RpcServer {
    /// Bind the first free port in the configured range, announce it on
    /// stdout, and start serving.
    pub async fn start(
        config: &conductor_config::schema::ServerConfig,
        deps: ServerDeps,
    ) -> Result<RpcServer> {
        let listener = Self::bind_in_range(config.port_start, config.port_end).await?;
        let port = listener.local_addr()?.port();
        // Supervisor discovery line; emitted exactly once per server.
        println!("CONDUCTOR_BACKEND_PORT={port}");
        info!(port, "rpc server listening");

        let shutdown = CancellationToken::new();
        let sweeper = deps
            .authenticator
            .as_ref()
            .map(|a| a.start_sweeper(shutdown.clone()));

        let state = Arc::new(AppState {
            handlers: deps.handlers,
            authenticator: deps.authenticator,
            metrics: deps.metrics,
            sessions: DashMap::new(),
            shutdown: shutdown.clone(),
            closed: AtomicBool::new(false),
        });

        let stop = CancellationToken::new();
        let listener_stop = stop.clone();
        let router = build_router(Arc::clone(&state), deps.cost_api);
        let serve_task = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            let result = axum::serve(listener, service)
                .with_graceful_shutdown(async move { listener_stop.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "rpc server terminated with error");
            }
        });

        Ok(RpcServer {
            state,
            port,
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            stop,
            serve_task: Mutex::new(Some(serve_task)),
            sweeper: Mutex::new(sweeper),
        })
    }

    async fn bind_in_range(start: u16, end: u16) -> Result<TcpListener> {
        for port in start..=end {
            if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)).await {
                return Ok(listener);
            }
        }
        Err(ConductorError::NoPortAvailable { start, end })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn live_sessions(&self) -> usize {
        self.state.sessions.len()
    }

    /// Graceful shutdown: reject new connects, close every session with a
    /// Going-Away close, stop the HTTP server within the configured
    /// timeout, and stop the authenticator sweeper. A second call returns
    /// `ServerClosed`.
    pub async fn shutdown(&self) -> Result<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Err(ConductorError::ServerClosed);
        }
        info!("rpc server shutting down");
        // Sessions receive a Going-Away close; new connects see 503.
        self.state.shutdown.cancel();
        let drain_deadline = tokio::time::Instant::now() + CLOSE_DEADLINE;
        while !self.state.sessions.is_empty() && tokio::time::Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.stop.cancel();
        let task = self.serve_task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.shutdown_timeout, &mut task)
                .await
                .is_err()
            {
                warn!("graceful shutdown deadline exceeded, aborting server task");
                task.abort();
            }
        }
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        Ok(())
    }
}

fn build_router(state: Arc<AppState>, cost_api: Arc<CostApiState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .merge(costapi::router(cost_api))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    state.metrics.inc_http_requests();
    if state.closed.load(Ordering::SeqCst) {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "error"})),
        )
            .into_response()
    } else {
        (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "version": env!("CARGO_PKG_VERSION"),
                "message": "conductor backend running",
            })),
        )
            .into_response()
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let body = state.metrics.render_prometheus();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    state.metrics.inc_http_requests();
    if state.closed.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if let Some(ref authenticator) = state.authenticator {
        let token = headers
            .get(AUTH_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        match authenticator.validate(token, &addr.to_string()) {
            AuthOutcome::Ok => {}
            AuthOutcome::Unauthorized => {
                state.metrics.inc_auth_rejections();
                // The supplied token is never logged.
                warn!(source = %addr.ip(), "rejected connection: invalid token");
                return StatusCode::UNAUTHORIZED.into_response();
            }
            AuthOutcome::RateLimited => {
                state.metrics.inc_auth_rejections();
                warn!(source = %addr.ip(), "rejected connection: rate limited");
                return StatusCode::TOO_MANY_REQUESTS.into_response();
            }
        }
    }
    let state = Arc::clone(&state);
    ws.on_upgrade(move |socket| session_loop(state, socket))
}

async fn session_loop(state: Arc<AppState>, socket: WebSocket) {
    let session_id = uuid::Uuid::new_v4().to_string();
    state.metrics.inc_sessions_opened();
    let session_cancel = state.shutdown.child_token();
    let (out_tx, out_rx) = mpsc::channel::<Frame>(64);
    let handle = SessionHandle::new(session_id.clone(), out_tx);
    state
        .sessions
        .insert(session_id.clone(), session_cancel.clone());
    info!(session = %session_id, "session opened");

    let (sink, mut source) = socket.split();
    let writer = tokio::spawn(writer_loop(sink, out_rx, session_cancel.clone()));

    let mut cancelled = false;
    loop {
        let next = tokio::select! {
            _ = session_cancel.cancelled() => {
                cancelled = true;
                break;
            }
            next = tokio::time::timeout(READ_DEADLINE, source.next()) => next,
        };
        let message = match next {
            Err(_) => {
                debug!(session = %session_id, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(message))) => message,
        };
        match message {
            ws::Message::Text(text) => {
                handle_text(&state, &handle, &session_cancel, text.as_str()).await;
            }
            // The deadline refreshes on every inbound message, pongs
            // included; pings are answered by the transport.
            ws::Message::Pong(_) | ws::Message::Ping(_) | ws::Message::Binary(_) => {}
            ws::Message::Close(_) => break,
        }
    }
    if cancelled {
        // The writer has queued a Going-Away close; give the peer the close
        // deadline to finish the handshake, then drop the connection.
        let _ = tokio::time::timeout(CLOSE_DEADLINE, async {
            while let Some(Ok(message)) = source.next().await {
                if matches!(message, ws::Message::Close(_)) {
                    break;
                }
            }
        })
        .await;
    }

    state.sessions.remove(&session_id);
    session_cancel.cancel();
    let _ = writer.await;
    info!(session = %session_id, "session closed");
}

/// Single writer per session: frames never interleave, pings go out every
/// `PING_INTERVAL`, and shutdown sends a Going-Away close.
async fn writer_loop(
    mut sink: SplitSink<WebSocket, ws::Message>,
    mut out_rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let close = ws::Message::Close(Some(ws::CloseFrame {
                    code: GOING_AWAY,
                    reason: "going away".into(),
                }));
                let _ = tokio::time::timeout(CLOSE_DEADLINE, sink.send(close)).await;
                break;
            }
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                match frame.encode() {
                    Ok(text) => {
                        if sink.send(ws::Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping unencodable outbound frame"),
                }
            }
            _ = ping.tick() => {
                if sink.send(ws::Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn handle_text(
    state: &Arc<AppState>,
    handle: &SessionHandle,
    cancel: &CancellationToken,
    raw: &str,
) {
    let frame = match Frame::decode(raw) {
        Ok(frame) => frame,
        Err(e) => {
            state.metrics.inc_rpc_errors();
            // No usable correlation id on an undecodable frame.
            let _ = handle.send_frame(Frame::error("-", &e)).await;
            return;
        }
    };

    match frame.frame_type {
        FrameType::Handshake => {
            let version = frame.version.unwrap_or_default();
            let reply = if version == PROTOCOL_VERSION {
                Frame::handshake(frame.correlation_id, PROTOCOL_VERSION)
            } else {
                Frame::error(
                    frame.correlation_id,
                    &ConductorError::UnsupportedVersion(version),
                )
            };
            let _ = handle.send_frame(reply).await;
        }
        FrameType::Request => {
            state.metrics.inc_rpc_requests();
            let method = frame.method.unwrap_or_default();
            let correlation_id = frame.correlation_id;
            let params = frame.params.unwrap_or(Value::Null);

            match state.handlers.dispatch(&method) {
                Err(e) => {
                    state.metrics.inc_rpc_errors();
                    let _ = handle.send_frame(Frame::error(correlation_id, &e)).await;
                }
                Ok(Dispatch::Unary(handler)) => {
                    let ctx = HandlerContext {
                        session_id: handle.id().to_string(),
                        correlation_id: correlation_id.clone(),
                        cancel: cancel.child_token(),
                    };
                    let handle = handle.clone();
                    let state = Arc::clone(state);
                    tokio::spawn(async move {
                        match handler(ctx, params).await {
                            Ok(result) => {
                                let _ = handle
                                    .send_frame(Frame::response(correlation_id, result))
                                    .await;
                            }
                            Err(e) => {
                                state.metrics.inc_rpc_errors();
                                let _ =
                                    handle.send_frame(Frame::error(correlation_id, &e)).await;
                            }
                        }
                    });
                }
                Ok(Dispatch::Stream(handler)) => {
                    let ctx = HandlerContext {
                        session_id: handle.id().to_string(),
                        correlation_id: correlation_id.clone(),
                        cancel: cancel.child_token(),
                    };
                    let writer = StreamWriter::new(handle.clone(), correlation_id.clone());
                    let closed = writer.closed_flag();
                    let handle = handle.clone();
                    let state = Arc::clone(state);
                    tokio::spawn(async move {
                        if let Err(e) = handler(ctx, params, writer).await {
                            state.metrics.inc_rpc_errors();
                            // Errors travel as an Error frame unless the
                            // handler already terminated the stream.
                            if !closed.load(Ordering::SeqCst) {
                                let _ =
                                    handle.send_frame(Frame::error(correlation_id, &e)).await;
                            }
                        }
                    });
                }
            }
        }
        FrameType::Response | FrameType::Stream | FrameType::Error => {
            let e = ConductorError::InvalidMessage(format!(
                "unexpected client frame of type {:?}",
                frame.frame_type
            ));
            let _ = handle.send_frame(Frame::error(frame.correlation_id, &e)).await;
        }
    }
}
