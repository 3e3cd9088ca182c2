use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Root configuration — maps to `conductor.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    pub server: ServerConfig,
    pub retry: RetryConfig,
    pub failover: FailoverConfig,
    pub cost: CostConfig,
    pub logging: LoggingConfig,
    /// Provider credential sections keyed by provider name, e.g.
    /// `[providers.anthropic]`.
    pub providers: HashMap<String, ProviderCredentials>,
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Inclusive port search range on loopback; the first free port wins.
    pub port_start: u16,
    pub port_end: u16,
    /// Graceful shutdown deadline in seconds.
    pub shutdown_timeout_secs: u64,
    /// When non-empty, clients must present this token on connect.
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port_start: 9100,
            port_end: 9199,
            shutdown_timeout_secs: 5,
            auth_token: None,
        }
    }
}

// ── Retry ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 0 disables retries entirely.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Backoff multiplier, must be > 1.
    pub multiplier: f64,
    /// Jitter fraction in [0, 1].
    pub jitter: f64,
    /// Optional overall cap on one invocation, in seconds.
    pub absolute_timeout_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.2,
            absolute_timeout_secs: None,
        }
    }
}

// ── Failover ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Ordered provider names to try. Empty means no failover chain.
    pub order: Vec<String>,
    /// Consecutive failures before the breaker opens; 0 disables.
    pub circuit_breaker_threshold: u32,
    /// How long an open breaker waits before a half-open probe, in seconds.
    pub circuit_breaker_timeout_secs: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            order: vec![],
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_secs: 60,
        }
    }
}

// ── Cost accounting ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// SQLite database path; defaults next to the config dir.
    pub db_path: Option<PathBuf>,
    /// Records older than this are eligible for `deleteOlderThan` sweeps.
    pub retention_days: u32,
    /// Users granted the cost-admin role at startup.
    pub admin_users: Vec<String>,
    /// Users granted the cost-viewer role at startup.
    pub viewer_users: Vec<String>,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            retention_days: 90,
            admin_users: vec![],
            viewer_users: vec![],
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing env-filter directive, e.g. "info" or "conductor=debug".
    pub level: String,
    /// Emit JSON log lines instead of the human format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

// ── Provider credentials ───────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderCredentials {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl ConductorConfig {
    /// Validate the config. Returns warnings; hard errors fail the load.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.server.port_start > self.server.port_end {
            return Err(format!(
                "server.port_start ({}) must not exceed server.port_end ({})",
                self.server.port_start, self.server.port_end
            ));
        }
        if self.retry.multiplier <= 1.0 {
            return Err(format!(
                "retry.multiplier must be > 1, got {}",
                self.retry.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(format!(
                "retry.jitter must be within [0, 1], got {}",
                self.retry.jitter
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            warnings.push(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({}); backoff is capped",
                self.retry.initial_delay_ms, self.retry.max_delay_ms
            ));
        }
        for name in &self.failover.order {
            if name.is_empty() {
                return Err("failover.order contains an empty provider name".into());
            }
        }
        if let Some(ref token) = self.server.auth_token
            && token.len() < 16
        {
            warnings.push("server.auth_token is short; generate one with `conductor token generate`".into());
        }

        Ok(warnings)
    }
}
