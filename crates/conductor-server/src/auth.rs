//! Token authentication with per-source rate limiting and lockout.
//!
//! Tokens are 32 cryptographically-random bytes, URL-safe base64 without
//! padding (43 characters). Validation compares in constant time and counts
//! failures per source host in a sliding window; crossing the threshold
//! locks the source out, during which even a correct token is rejected.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Header carrying the client token on the upgrade request.
pub const AUTH_HEADER: &str = "x-conductor-token";

/// Rate-limit tuning.
#[derive(Debug, Clone, Copy)]
pub struct AuthConfig {
    /// Sliding window in which failures are counted.
    pub window: Duration,
    /// Failures within the window that trigger a lockout.
    pub max_failures: u32,
    /// How long a locked-out source stays rejected.
    pub lockout: Duration,
    /// Cadence of the background sweep of stale entries.
    pub sweep_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_failures: 5,
            lockout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Outcome of a token check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok,
    Unauthorized,
    RateLimited,
}

#[derive(Debug, Default)]
struct SourceState {
    failures: VecDeque<Instant>,
    locked_until: Option<Instant>,
}

/// Constant-time token validator with per-source failure tracking.
pub struct TokenAuthenticator {
    token: String,
    config: AuthConfig,
    sources: DashMap<String, SourceState>,
}

/// Generate a fresh token: 32 random bytes, URL-safe base64, no padding.
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// "host[:port]" — the host alone keys the failure table.
fn host_key(source: &str) -> &str {
    match source.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => source,
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

impl TokenAuthenticator {
    pub fn new(token: String, config: AuthConfig) -> Self {
        Self {
            token,
            config,
            sources: DashMap::new(),
        }
    }

    /// Check a presented token from `source` ("host[:port]").
    ///
    /// A locked-out source gets `RateLimited` regardless of the token. A
    /// success clears the source's failure counter.
    pub fn validate(&self, token: &str, source: &str) -> AuthOutcome {
        let key = host_key(source).to_string();
        let now = Instant::now();
        let mut state = self.sources.entry(key).or_default();

        if let Some(until) = state.locked_until {
            if now < until {
                return AuthOutcome::RateLimited;
            }
            // Lockout elapsed: counters clear before this attempt is judged.
            state.locked_until = None;
            state.failures.clear();
        }

        if constant_time_eq(token, &self.token) {
            state.failures.clear();
            return AuthOutcome::Ok;
        }

        while let Some(front) = state.failures.front() {
            if now.duration_since(*front) > self.config.window {
                state.failures.pop_front();
            } else {
                break;
            }
        }
        state.failures.push_back(now);
        if state.failures.len() as u32 >= self.config.max_failures {
            state.locked_until = Some(now + self.config.lockout);
            debug!(source = %host_key(source), "auth lockout engaged");
        }
        AuthOutcome::Unauthorized
    }

    /// Drop entries whose window has expired and whose lockout has elapsed.
    pub fn sweep(&self) {
        let now = Instant::now();
        let window = self.config.window;
        self.sources.retain(|_, state| {
            let locked = state.locked_until.map(|u| now < u).unwrap_or(false);
            let live_failures = state
                .failures
                .iter()
                .any(|t| now.duration_since(*t) <= window);
            locked || live_failures
        });
    }

    /// Tracked source count, for tests and the sweeper.
    pub fn tracked_sources(&self) -> usize {
        self.sources.len()
    }

    /// Spawn the periodic sweeper; it stops when `stop` is cancelled.
    pub fn start_sweeper(self: &Arc<Self>, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
        let auth = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(auth.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => auth.sweep(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(window_ms: u64, max_failures: u32, lockout_ms: u64) -> TokenAuthenticator {
        TokenAuthenticator::new(
            "secret-token".into(),
            AuthConfig {
                window: Duration::from_millis(window_ms),
                max_failures,
                lockout: Duration::from_millis(lockout_ms),
                sweep_interval: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn generated_tokens_are_43_chars_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 43);
        assert_eq!(b.len(), 43);
        assert_ne!(a, b);
        assert!(!a.contains('='));
    }

    #[test]
    fn correct_token_succeeds() {
        let auth = auth(60_000, 5, 60_000);
        assert_eq!(auth.validate("secret-token", "10.0.0.1:5000"), AuthOutcome::Ok);
    }

    #[test]
    fn host_key_strips_port_only() {
        assert_eq!(host_key("10.0.0.1:5000"), "10.0.0.1");
        assert_eq!(host_key("10.0.0.1"), "10.0.0.1");
        assert_eq!(host_key("example.com:80"), "example.com");
        assert_eq!(host_key("weird:name"), "weird:name");
    }

    #[test]
    fn lockout_after_threshold() {
        let auth = auth(60_000, 5, 60_000);
        // Five wrong attempts: all Unauthorized.
        for _ in 0..5 {
            assert_eq!(
                auth.validate("wrong", "10.0.0.1:1"),
                AuthOutcome::Unauthorized
            );
        }
        // Sixth is rate limited.
        assert_eq!(
            auth.validate("wrong", "10.0.0.1:2"),
            AuthOutcome::RateLimited
        );
        // Even the correct token is rejected during lockout.
        assert_eq!(
            auth.validate("secret-token", "10.0.0.1:3"),
            AuthOutcome::RateLimited
        );
        // A different source is unaffected.
        assert_eq!(
            auth.validate("secret-token", "10.0.0.2:1"),
            AuthOutcome::Ok
        );
    }

    #[test]
    fn lockout_expires_and_counters_clear() {
        let auth = auth(60_000, 2, 30);
        assert_eq!(auth.validate("wrong", "h"), AuthOutcome::Unauthorized);
        assert_eq!(auth.validate("wrong", "h"), AuthOutcome::Unauthorized);
        assert_eq!(auth.validate("secret-token", "h"), AuthOutcome::RateLimited);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(auth.validate("secret-token", "h"), AuthOutcome::Ok);
    }

    #[test]
    fn success_clears_failure_counter() {
        let auth = auth(60_000, 3, 60_000);
        auth.validate("wrong", "h");
        auth.validate("wrong", "h");
        assert_eq!(auth.validate("secret-token", "h"), AuthOutcome::Ok);
        // The window restarts: two more failures do not lock out.
        assert_eq!(auth.validate("wrong", "h"), AuthOutcome::Unauthorized);
        assert_eq!(auth.validate("wrong", "h"), AuthOutcome::Unauthorized);
        assert_eq!(auth.validate("secret-token", "h"), AuthOutcome::Ok);
    }

    #[test]
    fn window_expiry_forgets_failures() {
        let auth = auth(20, 2, 60_000);
        auth.validate("wrong", "h");
        std::thread::sleep(Duration::from_millis(40));
        // The first failure is outside the window now.
        assert_eq!(auth.validate("wrong", "h"), AuthOutcome::Unauthorized);
        assert_eq!(auth.validate("secret-token", "h"), AuthOutcome::Ok);
    }

    #[test]
    fn sweep_drops_stale_entries() {
        let auth = auth(10, 5, 10);
        auth.validate("wrong", "a");
        auth.validate("wrong", "b");
        assert_eq!(auth.tracked_sources(), 2);
        std::thread::sleep(Duration::from_millis(30));
        auth.sweep();
        assert_eq!(auth.tracked_sources(), 0);
    }
}
