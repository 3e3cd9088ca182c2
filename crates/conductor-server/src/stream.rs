use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

use conductor_core::{ConductorError, Frame, Result};

/// Cheap handle onto one session's outbound frame queue.
///
/// A single writer task drains the queue onto the transport, so frames from
/// concurrent handlers never interleave mid-message.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    tx: mpsc::Sender<Frame>,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>, tx: mpsc::Sender<Frame>) -> Self {
        Self { id: id.into(), tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a frame for the session writer. Fails once the session is gone.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ConductorError::StreamClosed)
    }
}

/// Ordered emitter of partial results for one request on one session.
///
/// Bound to a correlation id and a stream id. `done` emits the final-chunk
/// frame exactly once; any `send` after that fails with `StreamClosed`.
pub struct StreamWriter {
    session: SessionHandle,
    correlation_id: String,
    stream_id: String,
    closed: Arc<AtomicBool>,
}

impl StreamWriter {
    pub fn new(session: SessionHandle, correlation_id: impl Into<String>) -> Self {
        Self {
            session,
            correlation_id: correlation_id.into(),
            stream_id: uuid::Uuid::new_v4().to_string(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_done(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shared view of the closed flag, for callers that hand the writer off
    /// and still need to know whether the stream terminated.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }

    /// Emit one partial payload.
    pub async fn send(&self, payload: Value) -> Result<()> {
        if self.is_done() {
            return Err(ConductorError::StreamClosed);
        }
        self.session
            .send_frame(Frame::stream_chunk(
                self.correlation_id.clone(),
                self.stream_id.clone(),
                payload,
            ))
            .await
    }

    /// Terminate the stream: the final-chunk flag set and no payload.
    pub async fn done(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ConductorError::StreamClosed);
        }
        self.session
            .send_frame(Frame::stream_end(
                self.correlation_id.clone(),
                self.stream_id.clone(),
            ))
            .await
    }
}
