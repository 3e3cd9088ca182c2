use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

/// Circuit breaker tuning. A threshold of 0 disables the breaker entirely.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub threshold: u32,
    /// How long an open circuit waits before allowing a half-open probe.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    open: bool,
}

/// Point-in-time view of one provider's circuit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub open: bool,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// Per-provider consecutive-failure gate with a recovery timeout.
///
/// Invariant: open implies `consecutive_failures >= threshold`; closing the
/// circuit resets the counter to zero.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a request to `provider` should be attempted right now.
    ///
    /// An open circuit past its recovery timeout transitions to half-open:
    /// the counter clears, the circuit closes, and this one probe is allowed.
    pub fn allow_request(&self, provider: &str) -> bool {
        if self.config.threshold == 0 {
            return true;
        }
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(provider) else {
            return true;
        };
        if !state.open {
            return true;
        }
        let recovered = state
            .last_failure
            .map(|t| t.elapsed() > self.config.recovery_timeout)
            .unwrap_or(true);
        if recovered {
            state.open = false;
            state.consecutive_failures = 0;
            return true;
        }
        false
    }

    pub fn record_success(&self, provider: &str) {
        let mut states = self.states.lock();
        let state = states.entry(provider.to_string()).or_default();
        state.open = false;
        state.consecutive_failures = 0;
    }

    pub fn record_failure(&self, provider: &str) {
        if self.config.threshold == 0 {
            return;
        }
        let mut states = self.states.lock();
        let state = states.entry(provider.to_string()).or_default();
        state.consecutive_failures += 1;
        state.last_failure = Some(Instant::now());
        state.last_failure_at = Some(Utc::now());
        if !state.open && state.consecutive_failures >= self.config.threshold {
            state.open = true;
            warn!(
                provider,
                failures = state.consecutive_failures,
                "circuit breaker open"
            );
        }
    }

    /// Snapshot of every tracked provider's circuit.
    pub fn status(&self) -> HashMap<String, BreakerStatus> {
        self.states
            .lock()
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    BreakerStatus {
                        open: state.open,
                        consecutive_failures: state.consecutive_failures,
                        last_failure_time: state.last_failure_at,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
        })
    }

    #[test]
    fn unknown_provider_is_allowed() {
        assert!(breaker(3, 1000).allow_request("p1"));
    }

    #[test]
    fn opens_at_threshold() {
        let cb = breaker(3, 60_000);
        cb.record_failure("p1");
        cb.record_failure("p1");
        assert!(cb.allow_request("p1"));
        cb.record_failure("p1");
        assert!(!cb.allow_request("p1"));
        let status = cb.status();
        assert!(status["p1"].open);
        assert_eq!(status["p1"].consecutive_failures, 3);
    }

    #[test]
    fn success_resets() {
        let cb = breaker(2, 60_000);
        cb.record_failure("p1");
        cb.record_failure("p1");
        assert!(!cb.allow_request("p1"));
        cb.record_success("p1");
        assert!(cb.allow_request("p1"));
        assert_eq!(cb.status()["p1"].consecutive_failures, 0);
    }

    #[test]
    fn half_open_probe_after_recovery() {
        let cb = breaker(1, 20);
        cb.record_failure("p1");
        assert!(!cb.allow_request("p1"));
        std::thread::sleep(Duration::from_millis(40));
        // Recovery elapsed: the probe is allowed and the circuit closes.
        assert!(cb.allow_request("p1"));
        assert!(!cb.status()["p1"].open);
    }

    #[test]
    fn threshold_zero_disables() {
        let cb = breaker(0, 10);
        for _ in 0..100 {
            cb.record_failure("p1");
        }
        assert!(cb.allow_request("p1"));
    }

    #[test]
    fn providers_are_independent() {
        let cb = breaker(1, 60_000);
        cb.record_failure("p1");
        assert!(!cb.allow_request("p1"));
        assert!(cb.allow_request("p2"));
    }
}
