//! Telemetry Aggregator: merges per-agent `AgentMetrics` snapshots into
//! per-run rollups. The single source of truth for "latest per-agent
//! metrics" — the status API and run finalisation both read from here.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::{AgentMetrics, AgentResult};
use crate::persistence::PersistenceAdapter;

const PER_AGENT_RATE_LIMIT_SECS: i64 = 1;

#[derive(Default)]
struct RunState {
    results: HashMap<String, AgentResult>,
    last_accepted: HashMap<String, DateTime<Utc>>,
}

pub struct TelemetryAggregator {
    persistence: Arc<dyn PersistenceAdapter>,
    runs: RwLock<HashMap<String, RunState>>,
    /// The run currently accepting telemetry; snapshots are discarded when absent.
    current_run: RwLock<Option<String>>,
}

impl TelemetryAggregator {
    pub fn new(persistence: Arc<dyn PersistenceAdapter>) -> Arc<Self> {
        Arc::new(TelemetryAggregator {
            persistence,
            runs: RwLock::new(HashMap::new()),
            current_run: RwLock::new(None),
        })
    }

    pub async fn set_current_run(&self, run_id: Option<String>) {
        *self.current_run.write().await = run_id;
    }

    pub async fn current_run(&self) -> Option<String> {
        self.current_run.read().await.clone()
    }

    /// Resets accumulated state for a fresh run (used when a run id is reused
    /// via rerun, though rerun always mints a new id — kept for symmetry with
    /// `take_results`).
    pub async fn start_run(&self, run_id: &str) {
        self.runs.write().await.insert(run_id.to_string(), RunState::default());
    }

    /// Accepts a telemetry snapshot, applying the per-agent 1s rate limit.
    /// Returns `true` if the snapshot was accepted and persisted.
    pub async fn accept(&self, region: impl Into<String>, metrics: AgentMetrics) -> bool {
        let Some(run_id) = self.current_run().await else {
            debug!(agent_id = %metrics.agent_id, "telemetry discarded: no active run");
            return false;
        };

        let mut runs = self.runs.write().await;
        let state = runs.entry(run_id.clone()).or_default();

        if let Some(last) = state.last_accepted.get(&metrics.agent_id) {
            if metrics.timestamp.signed_duration_since(*last) < chrono::Duration::seconds(PER_AGENT_RATE_LIMIT_SECS) {
                return false;
            }
        }
        state.last_accepted.insert(metrics.agent_id.clone(), metrics.timestamp);

        let region = region.into();
        let result = metrics.into_agent_result(region);
        state.results.insert(result.agent_id.clone(), result.clone());
        drop(runs);

        let persistence = Arc::clone(&self.persistence);
        let run_id_for_persist = run_id.clone();
        tokio::spawn(async move {
            if let Err(e) = persistence.upsert_agent_result(&run_id_for_persist, &result).await {
                tracing::error!(error = %e, run_id = %run_id_for_persist, "failed to persist agent result");
            }
        });

        true
    }

    pub async fn snapshot(&self, run_id: &str) -> Vec<AgentResult> {
        self.runs
            .read()
            .await
            .get(run_id)
            .map(|s| s.results.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn clear_run(&self, run_id: &str) {
        self.runs.write().await.remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;

    fn metrics(agent_id: &str, ts: DateTime<Utc>, requests: u64, errors: u64) -> AgentMetrics {
        AgentMetrics {
            agent_id: agent_id.to_string(),
            timestamp: ts,
            requests,
            errors,
            avg_latency_ms: 10.0,
            min_latency_ms: 1.0,
            max_latency_ms: 20.0,
            status_codes: [("200".to_string(), requests - errors), ("500".to_string(), errors)]
                .into_iter()
                .collect(),
        }
    }

    #[tokio::test]
    async fn discards_telemetry_without_active_run() {
        let agg = TelemetryAggregator::new(Arc::new(InMemoryPersistence::new()));
        let accepted = agg.accept("us-east", metrics("a1", Utc::now(), 10, 0)).await;
        assert!(!accepted);
    }

    #[tokio::test]
    async fn accepts_and_snapshots_latest_per_agent() {
        let agg = TelemetryAggregator::new(Arc::new(InMemoryPersistence::new()));
        agg.set_current_run(Some("run-1".into())).await;

        let t0 = Utc::now();
        assert!(agg.accept("us-east", metrics("a1", t0, 10, 1)).await);
        let snapshot = agg.snapshot("run-1").await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].requests, 10);
    }

    #[tokio::test]
    async fn rate_limits_snapshots_within_one_second() {
        let agg = TelemetryAggregator::new(Arc::new(InMemoryPersistence::new()));
        agg.set_current_run(Some("run-1".into())).await;

        let t0 = Utc::now();
        assert!(agg.accept("us-east", metrics("a1", t0, 10, 0)).await);
        let t_soon = t0 + chrono::Duration::milliseconds(500);
        assert!(!agg.accept("us-east", metrics("a1", t_soon, 20, 0)).await);

        let t_later = t0 + chrono::Duration::seconds(2);
        assert!(agg.accept("us-east", metrics("a1", t_later, 30, 0)).await);
        let snapshot = agg.snapshot("run-1").await;
        assert_eq!(snapshot[0].requests, 30);
    }

    #[tokio::test]
    async fn errors_never_exceed_requests_in_accepted_snapshot() {
        let agg = TelemetryAggregator::new(Arc::new(InMemoryPersistence::new()));
        agg.set_current_run(Some("run-1".into())).await;
        agg.accept("us-east", metrics("a1", Utc::now(), 100, 5)).await;
        let snapshot = agg.snapshot("run-1").await;
        let r = &snapshot[0];
        assert!(r.errors <= r.requests);
        let status_sum: u64 = r.status_codes.values().sum();
        assert!(status_sum >= r.requests - r.errors);
    }
}
