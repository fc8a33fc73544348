//! Coordinator: wires the [`Registry`], [`TelemetryAggregator`] and
//! [`TestRunManager`] to the inbound subjects agents publish on. The Control
//! API (see [`crate::api`]) talks to the same three components directly; this
//! module only owns the subscription loops.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use chrono::Utc;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::aggregator::TelemetryAggregator;
use crate::bus::MessageBus;
use crate::errors::AppError;
use crate::metrics::COORDINATOR_CONNECTED_AGENTS;
use crate::model::{AgentExecutionState, AgentStatusMessage, HeartbeatMessage, PhaseCompleteMessage, RegisterAction, RegisterMessage};
use crate::persistence::PersistenceAdapter;
use crate::registry::Registry;
use crate::run_manager::TestRunManager;

const AGENT_REGISTER_SUBJECT: &str = "armonite.agent.register";
const AGENT_HEARTBEAT_SUBJECT: &str = "armonite.agent.heartbeat";
const AGENT_STATUS_SUBJECT: &str = "armonite.agent.status";
const TELEMETRY_SUBJECT: &str = "armonite.telemetry";

static PROCESS_STARTED_AT: OnceLock<Instant> = OnceLock::new();

fn process_uptime_secs() -> u64 {
    PROCESS_STARTED_AT.get_or_init(Instant::now).elapsed().as_secs()
}

pub struct Coordinator {
    pub bus: Arc<dyn MessageBus>,
    pub persistence: Arc<dyn PersistenceAdapter>,
    pub registry: Arc<Registry>,
    pub aggregator: Arc<TelemetryAggregator>,
    pub run_manager: Arc<TestRunManager>,
}

impl Coordinator {
    pub fn new(bus: Arc<dyn MessageBus>, persistence: Arc<dyn PersistenceAdapter>) -> Arc<Self> {
        PROCESS_STARTED_AT.get_or_init(Instant::now);
        let registry = Registry::new();
        let aggregator = TelemetryAggregator::new(Arc::clone(&persistence));
        let run_manager = TestRunManager::new(
            Arc::clone(&bus),
            Arc::clone(&persistence),
            Arc::clone(&registry),
            Arc::clone(&aggregator),
        );
        Arc::new(Coordinator {
            bus,
            persistence,
            registry,
            aggregator,
            run_manager,
        })
    }

    /// Loads persisted runs, starts the registry janitor, and subscribes to
    /// every inbound agent subject. Each subscription runs in its own task so
    /// a panic handling one message never takes down the others.
    pub async fn start(self: &Arc<Self>) -> Result<(), AppError> {
        self.run_manager.load_from_persistence().await?;
        self.registry.spawn_janitor();

        self.spawn_register_loop().await?;
        self.spawn_heartbeat_loop().await?;
        self.spawn_status_loop().await?;
        self.spawn_telemetry_loop().await?;

        info!("coordinator subscriptions established");
        Ok(())
    }

    async fn spawn_register_loop(self: &Arc<Self>) -> Result<(), AppError> {
        let mut stream = self.bus.subscribe(AGENT_REGISTER_SUBJECT).await?;
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let Ok(register) = serde_json::from_slice::<RegisterMessage>(&msg.payload) else {
                    warn!("malformed register message, discarding");
                    continue;
                };
                let coordinator = Arc::clone(&coordinator);
                if let Err(e) = tokio::spawn(async move { coordinator.handle_register(register).await }).await {
                    error!(error = %e, "register handler panicked");
                }
            }
        });
        Ok(())
    }

    async fn spawn_heartbeat_loop(self: &Arc<Self>) -> Result<(), AppError> {
        let mut stream = self.bus.subscribe(AGENT_HEARTBEAT_SUBJECT).await?;
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let Ok(heartbeat) = serde_json::from_slice::<HeartbeatMessage>(&msg.payload) else {
                    continue;
                };
                let coordinator = Arc::clone(&coordinator);
                if let Err(e) = tokio::spawn(async move {
                    coordinator.registry.heartbeat(&heartbeat.agent_id, heartbeat.timestamp).await;
                })
                .await
                {
                    error!(error = %e, "heartbeat handler panicked");
                }
            }
        });
        Ok(())
    }

    async fn spawn_status_loop(self: &Arc<Self>) -> Result<(), AppError> {
        let mut stream = self.bus.subscribe(AGENT_STATUS_SUBJECT).await?;
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let Ok(status) = serde_json::from_slice::<AgentStatusMessage>(&msg.payload) else {
                    continue;
                };
                let coordinator = Arc::clone(&coordinator);
                if let Err(e) = tokio::spawn(async move { coordinator.handle_status(status).await }).await {
                    error!(error = %e, "status handler panicked");
                }
            }
        });
        Ok(())
    }

    async fn handle_status(&self, status: AgentStatusMessage) {
        let state = match status.status.as_str() {
            "idle" => AgentExecutionState::Idle,
            "starting" => AgentExecutionState::Starting,
            "running" => AgentExecutionState::Running,
            "stopping" => AgentExecutionState::Stopping,
            "completed" => AgentExecutionState::Completed,
            other => {
                warn!(agent_id = %status.agent_id, status = %other, "unrecognised agent status");
                return;
            }
        };
        self.registry.set_execution_state(&status.agent_id, state).await;
    }

    async fn spawn_telemetry_loop(self: &Arc<Self>) -> Result<(), AppError> {
        let mut stream = self.bus.subscribe(TELEMETRY_SUBJECT).await?;
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let Ok(metrics) = serde_json::from_slice::<crate::model::AgentMetrics>(&msg.payload) else {
                    continue;
                };
                let coordinator = Arc::clone(&coordinator);
                if let Err(e) = tokio::spawn(async move { coordinator.handle_telemetry(metrics).await }).await {
                    error!(error = %e, "telemetry handler panicked");
                }
            }
        });
        Ok(())
    }

    async fn handle_telemetry(&self, metrics: crate::model::AgentMetrics) {
        // Telemetry streaming counts as liveness too: an agent mid-run keeps
        // publishing metrics even if a heartbeat tick is skipped, and the
        // janitor must not reap it while it's actively reporting.
        self.registry.heartbeat(&metrics.agent_id, metrics.timestamp).await;
        let region = self
            .registry
            .get(&metrics.agent_id)
            .await
            .map(|a| a.region)
            .unwrap_or_else(|| "unknown".to_string());
        self.aggregator.accept(region, metrics).await;
    }

    async fn handle_register(self: &Arc<Self>, msg: RegisterMessage) {
        match msg.action {
            RegisterAction::Register => {
                let is_new = self
                    .registry
                    .register(&msg.agent_id, &msg.region, msg.concurrency, msg.timestamp)
                    .await;
                if is_new {
                    self.registry.log_new_agent(&msg.agent_id).await;
                }
                COORDINATOR_CONNECTED_AGENTS.set(self.registry.count().await as f64);
                self.run_manager.check_quorum().await;
            }
            RegisterAction::Unregister => {
                self.registry.unregister(&msg.agent_id).await;
                COORDINATOR_CONNECTED_AGENTS.set(self.registry.count().await as f64);
            }
        }
    }

    /// A lightweight status payload for the Control API's `/api/v1/status`.
    pub async fn status_snapshot(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            connected_agents: self.registry.count().await,
            current_run_id: self.run_manager.current_run_id().await,
            uptime_secs: process_uptime_secs(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CoordinatorStatus {
    pub connected_agents: usize,
    pub current_run_id: Option<String>,
    pub uptime_secs: u64,
    pub timestamp: chrono::DateTime<Utc>,
}

// PhaseCompleteMessage is consumed directly by PhaseOrchestrator::wait_for_phase
// on a per-run subject; the coordinator does not subscribe to it globally.
#[allow(dead_code)]
fn _phase_complete_routed_elsewhere(_: PhaseCompleteMessage) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::persistence::InMemoryPersistence;

    fn coordinator() -> Arc<Coordinator> {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let persistence: Arc<dyn PersistenceAdapter> = Arc::new(InMemoryPersistence::new());
        Coordinator::new(bus, persistence)
    }

    #[tokio::test]
    async fn register_message_adds_agent_to_registry() {
        let coordinator = coordinator();
        coordinator.start().await.unwrap();

        let msg = RegisterMessage {
            agent_id: "a1".into(),
            region: "us-east".into(),
            concurrency: 10,
            status: "idle".into(),
            timestamp: Utc::now(),
            action: RegisterAction::Register,
        };
        coordinator
            .bus
            .publish(AGENT_REGISTER_SUBJECT, &serde_json::to_vec(&msg).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(coordinator.registry.count().await, 1);
    }

    #[tokio::test]
    async fn unregister_message_removes_agent() {
        let coordinator = coordinator();
        coordinator.start().await.unwrap();
        coordinator.registry.register("a1", "r", 5, Utc::now()).await;

        let msg = RegisterMessage {
            agent_id: "a1".into(),
            region: "r".into(),
            concurrency: 5,
            status: "idle".into(),
            timestamp: Utc::now(),
            action: RegisterAction::Unregister,
        };
        coordinator
            .bus
            .publish(AGENT_REGISTER_SUBJECT, &serde_json::to_vec(&msg).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert_eq!(coordinator.registry.count().await, 0);
    }

    #[tokio::test]
    async fn telemetry_is_routed_to_aggregator_with_current_region() {
        let coordinator = coordinator();
        coordinator.start().await.unwrap();
        coordinator.registry.register("a1", "eu-west", 5, Utc::now()).await;
        coordinator.aggregator.set_current_run(Some("run-1".into())).await;

        let metrics = crate::model::AgentMetrics {
            agent_id: "a1".into(),
            timestamp: Utc::now(),
            requests: 10,
            errors: 0,
            avg_latency_ms: 5.0,
            min_latency_ms: 1.0,
            max_latency_ms: 10.0,
            status_codes: [("200".to_string(), 10)].into_iter().collect(),
        };
        coordinator
            .bus
            .publish(TELEMETRY_SUBJECT, &serde_json::to_vec(&metrics).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        let snapshot = coordinator.aggregator.snapshot("run-1").await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].region, "eu-west");
    }

    #[tokio::test]
    async fn telemetry_refreshes_registry_last_seen() {
        let coordinator = coordinator();
        coordinator.start().await.unwrap();
        let stale_seen = Utc::now() - chrono::Duration::seconds(45);
        coordinator.registry.register("a1", "eu-west", 5, stale_seen).await;

        let fresh_timestamp = Utc::now();
        let metrics = crate::model::AgentMetrics {
            agent_id: "a1".into(),
            timestamp: fresh_timestamp,
            requests: 1,
            errors: 0,
            avg_latency_ms: 1.0,
            min_latency_ms: 1.0,
            max_latency_ms: 1.0,
            status_codes: [("200".to_string(), 1)].into_iter().collect(),
        };
        coordinator
            .bus
            .publish(TELEMETRY_SUBJECT, &serde_json::to_vec(&metrics).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        let agent = coordinator.registry.get("a1").await.unwrap();
        assert_eq!(agent.last_seen, fresh_timestamp);
    }
}
