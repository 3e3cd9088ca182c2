use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Unified error type for the Conductor backend.
#[derive(Error, Debug)]
pub enum ConductorError {
    // ── Protocol errors ────────────────────────────────────────
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    // ── Auth errors ────────────────────────────────────────────
    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    // ── Dispatch errors ────────────────────────────────────────
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("method requires a streaming invocation: {0}")]
    RequiresStreaming(String),

    // ── Validation errors ──────────────────────────────────────
    #[error("validation failed: {0}")]
    Validation(String),

    // ── Provider errors ────────────────────────────────────────
    #[error("provider {provider} error: {message}")]
    Provider {
        provider: String,
        status: Option<u16>,
        message: String,
        suggestion: Option<String>,
        request_id: Option<String>,
    },

    #[error("timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("circuit open for provider {0}")]
    CircuitOpen(String),

    #[error("provider {provider} failed after {attempts} attempts")]
    RetriesExhausted {
        provider: String,
        attempts: u32,
        #[source]
        source: Box<ConductorError>,
    },

    #[error("all providers exhausted [{}]", attempted.join(", "))]
    FailoverExhausted {
        attempted: Vec<String>,
        #[source]
        source: Box<ConductorError>,
    },

    // ── Store errors ───────────────────────────────────────────
    #[error("store error: {0}")]
    Store(String),

    // ── Authorization errors ───────────────────────────────────
    #[error("forbidden: {0}")]
    Authorization(String),

    // ── Lifecycle errors ───────────────────────────────────────
    #[error("server is closed")]
    ServerClosed,

    #[error("stream is closed")]
    StreamClosed,

    #[error("no port available in range {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("operation cancelled")]
    Cancelled,

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ConductorError>;

impl ConductorError {
    /// Short stable code serialized into error frames and HTTP bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidMessage(_) => "invalid_message",
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited { .. } => "rate_limited",
            Self::MethodNotFound(_) => "method_not_found",
            Self::RequiresStreaming(_) => "requires_streaming",
            Self::Validation(_) => "validation_failed",
            Self::Provider { .. } => "provider_error",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen(_) => "circuit_open",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::FailoverExhausted { .. } => "failover_exhausted",
            Self::Store(_) => "store_error",
            Self::Authorization(_) => "forbidden",
            Self::ServerClosed => "server_closed",
            Self::StreamClosed => "stream_closed",
            Self::NoPortAvailable { .. } => "no_port_available",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Other(_) => "internal_error",
        }
    }

    /// HTTP status carried by a provider error, if any.
    pub fn provider_status(&self) -> Option<u16> {
        match self {
            Self::Provider { status, .. } => *status,
            Self::RetriesExhausted { source, .. } | Self::FailoverExhausted { source, .. } => {
                source.provider_status()
            }
            _ => None,
        }
    }
}

static IP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(:\d+)?\b").unwrap());
static HOME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(/home/|/Users/)[A-Za-z0-9._-]+").unwrap());
static PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[\s('\x22])(/[A-Za-z0-9._-]+){2,}").unwrap());
static STACK_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*at\s.*$|(?m)^.*\.(rs|go|py|js):\d+.*$").unwrap());

/// Strip information that must never reach clients from an upstream error
/// message: absolute filesystem paths, home-directory usernames, IP
/// addresses, and stack-trace lines referencing source files.
pub fn sanitize_provider_message(message: &str) -> String {
    let s = STACK_LINE_RE.replace_all(message, "");
    let s = HOME_RE.replace_all(&s, "~");
    let s = IP_RE.replace_all(&s, "[redacted]");
    let s = PATH_RE.replace_all(&s, " [path]");
    s.lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ConductorError::Unauthorized.code(), "unauthorized");
        assert_eq!(
            ConductorError::MethodNotFound("x".into()).code(),
            "method_not_found"
        );
        assert_eq!(ConductorError::ServerClosed.code(), "server_closed");
    }

    #[test]
    fn sanitize_strips_ips_and_homes() {
        let msg = "connect to 10.1.2.3:443 failed for /home/alice/secrets.txt";
        let clean = sanitize_provider_message(msg);
        assert!(!clean.contains("10.1.2.3"));
        assert!(!clean.contains("alice"));
    }

    #[test]
    fn sanitize_drops_stack_lines() {
        let msg = "upstream exploded\n  at handler (server.rs:42)\nsrc/foo.rs:10 in call\nplain tail";
        let clean = sanitize_provider_message(msg);
        assert!(clean.contains("upstream exploded"));
        assert!(clean.contains("plain tail"));
        assert!(!clean.contains("server.rs"));
        assert!(!clean.contains("foo.rs"));
    }

    #[test]
    fn provider_status_unwraps_through_wrappers() {
        let inner = ConductorError::Provider {
            provider: "p1".into(),
            status: Some(503),
            message: "boom".into(),
            suggestion: None,
            request_id: None,
        };
        let wrapped = ConductorError::RetriesExhausted {
            provider: "p1".into(),
            attempts: 3,
            source: Box::new(inner),
        };
        assert_eq!(wrapped.provider_status(), Some(503));
    }
}
