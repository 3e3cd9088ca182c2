//! Prometheus-compatible counters for the Conductor backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    http_requests_total: AtomicU64,
    sessions_opened_total: AtomicU64,
    rpc_requests_total: AtomicU64,
    rpc_errors_total: AtomicU64,
    llm_calls_total: AtomicU64,
    llm_prompt_tokens_total: AtomicU64,
    llm_completion_tokens_total: AtomicU64,
    /// Accumulated cost in micro-dollars (USD * 1_000_000).
    cost_microdollars_total: AtomicU64,
    auth_rejections_total: AtomicU64,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                http_requests_total: AtomicU64::new(0),
                sessions_opened_total: AtomicU64::new(0),
                rpc_requests_total: AtomicU64::new(0),
                rpc_errors_total: AtomicU64::new(0),
                llm_calls_total: AtomicU64::new(0),
                llm_prompt_tokens_total: AtomicU64::new(0),
                llm_completion_tokens_total: AtomicU64::new(0),
                cost_microdollars_total: AtomicU64::new(0),
                auth_rejections_total: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn inc_http_requests(&self) {
        self.inner.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_sessions_opened(&self) {
        self.inner.sessions_opened_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rpc_requests(&self) {
        self.inner.rpc_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rpc_errors(&self) {
        self.inner.rpc_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_auth_rejections(&self) {
        self.inner.auth_rejections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_llm_call(&self, prompt_tokens: u64, completion_tokens: u64, cost_usd: Option<f64>) {
        self.inner.llm_calls_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .llm_prompt_tokens_total
            .fetch_add(prompt_tokens, Ordering::Relaxed);
        self.inner
            .llm_completion_tokens_total
            .fetch_add(completion_tokens, Ordering::Relaxed);
        if let Some(cost) = cost_usd {
            let micro = (cost * 1_000_000.0).round().max(0.0) as u64;
            self.inner
                .cost_microdollars_total
                .fetch_add(micro, Ordering::Relaxed);
        }
    }

    pub fn render_prometheus(&self) -> String {
        let m = &self.inner;
        let mut out = String::new();
        let mut counter = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };
        counter(
            "conductor_http_requests_total",
            "Total HTTP requests served",
            m.http_requests_total.load(Ordering::Relaxed),
        );
        counter(
            "conductor_sessions_opened_total",
            "Total RPC sessions accepted",
            m.sessions_opened_total.load(Ordering::Relaxed),
        );
        counter(
            "conductor_rpc_requests_total",
            "Total RPC request frames dispatched",
            m.rpc_requests_total.load(Ordering::Relaxed),
        );
        counter(
            "conductor_rpc_errors_total",
            "Total RPC error frames emitted",
            m.rpc_errors_total.load(Ordering::Relaxed),
        );
        counter(
            "conductor_llm_calls_total",
            "Total upstream LLM calls",
            m.llm_calls_total.load(Ordering::Relaxed),
        );
        counter(
            "conductor_llm_prompt_tokens_total",
            "Total prompt tokens consumed",
            m.llm_prompt_tokens_total.load(Ordering::Relaxed),
        );
        counter(
            "conductor_llm_completion_tokens_total",
            "Total completion tokens produced",
            m.llm_completion_tokens_total.load(Ordering::Relaxed),
        );
        counter(
            "conductor_cost_microdollars_total",
            "Accumulated cost in micro-dollars",
            m.cost_microdollars_total.load(Ordering::Relaxed),
        );
        counter(
            "conductor_auth_rejections_total",
            "Total rejected authentication attempts",
            m.auth_rejections_total.load(Ordering::Relaxed),
        );
        out.push_str(&format!(
            "# HELP conductor_uptime_seconds Seconds since server start\n# TYPE conductor_uptime_seconds gauge\nconductor_uptime_seconds {}\n",
            m.started_at.elapsed().as_secs()
        ));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
