use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConductorError, Result};

/// Protocol version negotiated during the handshake.
pub const PROTOCOL_VERSION: &str = "1";

/// Frame variant discriminator, serialized as the `type` field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Request,
    Response,
    Stream,
    Error,
    Handshake,
}

/// Error descriptor carried by an error frame or an HTTP error body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Value>,
}

impl ErrorBody {
    pub fn from_error(err: &ConductorError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details: BTreeMap::new(),
        }
    }
}

/// The protocol envelope exchanged over the framed transport.
///
/// Every frame carries a correlation identifier linking responses, stream
/// chunks, and errors back to the originating request on the same session.
/// Payloads (`params`, `result`) are opaque to the codec and handed to
/// handlers for secondary decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream_done: bool,
}

impl Frame {
    fn base(frame_type: FrameType, correlation_id: impl Into<String>) -> Self {
        Self {
            frame_type,
            correlation_id: correlation_id.into(),
            version: None,
            method: None,
            params: None,
            result: None,
            error: None,
            stream_id: None,
            stream_done: false,
        }
    }

    pub fn request(
        correlation_id: impl Into<String>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::base(FrameType::Request, correlation_id)
        }
    }

    pub fn response(correlation_id: impl Into<String>, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::base(FrameType::Response, correlation_id)
        }
    }

    pub fn stream_chunk(
        correlation_id: impl Into<String>,
        stream_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            stream_id: Some(stream_id.into()),
            result: Some(payload),
            ..Self::base(FrameType::Stream, correlation_id)
        }
    }

    /// Terminal chunk: the streamDone flag set and no payload.
    pub fn stream_end(correlation_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: Some(stream_id.into()),
            stream_done: true,
            ..Self::base(FrameType::Stream, correlation_id)
        }
    }

    pub fn error(correlation_id: impl Into<String>, err: &ConductorError) -> Self {
        Self {
            error: Some(ErrorBody::from_error(err)),
            ..Self::base(FrameType::Error, correlation_id)
        }
    }

    pub fn handshake(correlation_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
            ..Self::base(FrameType::Handshake, correlation_id)
        }
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        if self.correlation_id.is_empty() {
            return Err(ConductorError::InvalidMessage(
                "missing correlation id".into(),
            ));
        }
        match self.frame_type {
            FrameType::Request => {
                if self.method.as_deref().unwrap_or("").is_empty() {
                    return Err(ConductorError::InvalidMessage(
                        "request frame requires a method".into(),
                    ));
                }
            }
            FrameType::Stream => {
                if self.stream_id.as_deref().unwrap_or("").is_empty() {
                    return Err(ConductorError::InvalidMessage(
                        "stream frame requires a streamId".into(),
                    ));
                }
            }
            FrameType::Handshake => {
                if self.version.as_deref().unwrap_or("").is_empty() {
                    return Err(ConductorError::InvalidMessage(
                        "handshake frame requires a version".into(),
                    ));
                }
            }
            FrameType::Response | FrameType::Error => {}
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<String> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Frame> {
        let frame: Frame = serde_json::from_str(raw)
            .map_err(|e| ConductorError::InvalidMessage(e.to_string()))?;
        frame.validate()?;
        Ok(frame)
    }
}
