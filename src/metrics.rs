//! Process-local Prometheus metrics. Agents track request volume and
//! latency; the coordinator tracks registry size and run status. Both
//! binaries expose these on a `/metrics` endpoint via the Control API /
//! agent-local health server.

use std::env;

use prometheus::{Encoder, Gauge, Histogram, IntCounter, IntCounterVec, Opts, Registry as PromRegistry, TextEncoder};

lazy_static::lazy_static! {
    static ref METRIC_NAMESPACE: String = env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "armonite".to_string());

    pub static ref AGENT_REQUESTS_TOTAL: IntCounter =
        IntCounter::with_opts(Opts::new("agent_requests_total", "Total HTTP requests issued by this agent")
            .namespace(METRIC_NAMESPACE.as_str())).unwrap();

    pub static ref AGENT_ERRORS_TOTAL: IntCounter =
        IntCounter::with_opts(Opts::new("agent_errors_total", "Total request errors observed by this agent")
            .namespace(METRIC_NAMESPACE.as_str())).unwrap();

    pub static ref AGENT_STATUS_CODES_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("agent_status_codes_total", "Responses by status code").namespace(METRIC_NAMESPACE.as_str()),
            &["status_code"],
        ).unwrap();

    pub static ref AGENT_REQUEST_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new("agent_request_duration_seconds", "Request latency in seconds")
                .namespace(METRIC_NAMESPACE.as_str()),
        ).unwrap();

    pub static ref AGENT_ACTIVE_WORKERS: Gauge =
        Gauge::with_opts(Opts::new("agent_active_workers", "Number of workers currently issuing requests")
            .namespace(METRIC_NAMESPACE.as_str())).unwrap();

    pub static ref COORDINATOR_CONNECTED_AGENTS: Gauge =
        Gauge::with_opts(Opts::new("coordinator_connected_agents", "Number of agents currently registered")
            .namespace(METRIC_NAMESPACE.as_str())).unwrap();

    pub static ref COORDINATOR_ACTIVE_RUNS: Gauge =
        Gauge::with_opts(Opts::new("coordinator_active_runs", "1 if a non-terminal run exists, else 0")
            .namespace(METRIC_NAMESPACE.as_str())).unwrap();
}

/// Builds a fresh registry with every metric registered, for the `/metrics`
/// text-exposition handler. A fresh registry per call avoids relying on
/// prometheus's global default registry, keeping tests hermetic.
pub fn registry() -> PromRegistry {
    let r = PromRegistry::new();
    let _ = r.register(Box::new(AGENT_REQUESTS_TOTAL.clone()));
    let _ = r.register(Box::new(AGENT_ERRORS_TOTAL.clone()));
    let _ = r.register(Box::new(AGENT_STATUS_CODES_TOTAL.clone()));
    let _ = r.register(Box::new(AGENT_REQUEST_DURATION_SECONDS.clone()));
    let _ = r.register(Box::new(AGENT_ACTIVE_WORKERS.clone()));
    let _ = r.register(Box::new(COORDINATOR_CONNECTED_AGENTS.clone()));
    let _ = r.register(Box::new(COORDINATOR_ACTIVE_RUNS.clone()));
    r
}

pub fn encode_text(registry: &PromRegistry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}
