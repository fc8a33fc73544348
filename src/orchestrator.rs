//! Phase Orchestrator: sequences `custom` ramp-up phases across agents,
//! coordinator-side. Only engaged when a plan's strategy is `custom` and at
//! least one phase is `sequential` — otherwise the coordinator uses the
//! simple broadcast path in [`crate::run_manager`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::duration::parse_duration_string;
use crate::model::{PhaseAssignment, PhaseCommand, PhaseCommandKind, PhaseCompleteMessage, PhaseMode, RampPhase};
use crate::registry::Registry;

pub fn agent_command_subject(agent_id: &str) -> String {
    format!("armonite.agent.{agent_id}.command")
}

pub fn phase_complete_subject(run_id: &str) -> String {
    format!("armonite.phase.complete.{run_id}")
}

/// Returns true when the coordinator must use the phase orchestrator instead
/// of the simple broadcast path.
pub fn needs_orchestration(strategy: &crate::model::RampUpStrategy) -> bool {
    strategy.strategy_type == crate::model::RampUpType::Custom
        && strategy.phases.iter().any(|p| p.mode == PhaseMode::Sequential)
}

pub struct PhaseOrchestrator {
    bus: Arc<dyn MessageBus>,
    registry: Arc<Registry>,
    run_id: String,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl PhaseOrchestrator {
    pub fn new(bus: Arc<dyn MessageBus>, registry: Arc<Registry>, run_id: String) -> Self {
        PhaseOrchestrator {
            bus,
            registry,
            run_id,
            stop: Mutex::new(None),
        }
    }

    /// Stops the orchestrator: no further phases are started after the one
    /// currently in flight returns control to `run_all`.
    pub async fn stop(&self) {
        if let Some(sender) = self.stop.lock().await.take() {
            let _ = sender.send(());
        }
    }

    /// Drives every phase to completion in order. Each phase fully starts
    /// before the next begins — the duration timer or all-agents-complete,
    /// whichever comes first, gates the advance.
    pub async fn run_all(&self, phases: &[RampPhase]) {
        let (stop_tx, _) = broadcast::channel(1);
        *self.stop.lock().await = Some(stop_tx.clone());

        for (index, phase) in phases.iter().enumerate() {
            let mut stop_rx = stop_tx.subscribe();
            if stop_rx.try_recv().is_ok() {
                info!(run_id = %self.run_id, phase = index, "orchestrator stopped before phase started");
                return;
            }

            let active_agents: Vec<String> = self.registry.list().await.into_iter().map(|a| a.id).collect();
            if active_agents.is_empty() {
                warn!(run_id = %self.run_id, phase = index, "no active agents for phase, skipping");
                continue;
            }

            let phase_duration = parse_duration_string(&phase.duration).unwrap_or(Duration::ZERO);
            let phase_id = format!("{}-phase-{}", self.run_id, index);

            match phase.mode {
                PhaseMode::Parallel => self.start_parallel(&active_agents, &phase_id, index, phase).await,
                PhaseMode::Sequential => {
                    self.start_sequential(&active_agents, &phase_id, index, phase, &mut stop_rx)
                        .await
                }
            }

            self.wait_for_phase(&phase_id, &active_agents, phase_duration, &mut stop_rx)
                .await;

            if stop_rx.try_recv().is_ok() {
                info!(run_id = %self.run_id, phase = index, "orchestrator stopped after phase");
                return;
            }
        }
    }

    async fn start_parallel(&self, agents: &[String], phase_id: &str, index: usize, phase: &RampPhase) {
        for agent_id in agents {
            self.publish_start_phase(agent_id, phase_id, index, phase).await;
        }
    }

    async fn start_sequential(
        &self,
        agents: &[String],
        phase_id: &str,
        index: usize,
        phase: &RampPhase,
        stop_rx: &mut broadcast::Receiver<()>,
    ) {
        let mut sorted = agents.to_vec();
        sorted.sort();

        let total = parse_duration_string(&phase.duration).unwrap_or(Duration::ZERO);
        let per_agent = total / sorted.len().max(1) as u32;
        let per_agent_phase = RampPhase {
            duration: crate::duration::format_duration(per_agent),
            concurrency: phase.concurrency,
            mode: PhaseMode::Sequential,
        };

        let start = tokio::time::Instant::now();
        for (k, agent_id) in sorted.iter().enumerate() {
            let delay = per_agent * k as u32;
            tokio::select! {
                _ = tokio::time::sleep_until(start + delay) => {}
                _ = stop_rx.recv() => return,
            }
            self.publish_start_phase(agent_id, phase_id, index, &per_agent_phase).await;
        }
    }

    async fn publish_start_phase(&self, agent_id: &str, phase_id: &str, index: usize, phase: &RampPhase) {
        let command = PhaseCommand {
            test_run_id: self.run_id.clone(),
            command: PhaseCommandKind::StartPhase,
            current_phase: Some(PhaseAssignment {
                phase_id: phase_id.to_string(),
                index,
                mode: phase.mode,
                concurrency: phase.concurrency,
                duration: phase.duration.clone(),
            }),
        };
        match serde_json::to_vec(&command) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&agent_command_subject(agent_id), &payload).await {
                    warn!(agent_id = %agent_id, error = %e, "failed to publish START_PHASE");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize START_PHASE command"),
        }
    }

    async fn wait_for_phase(
        &self,
        phase_id: &str,
        agents: &[String],
        duration: Duration,
        stop_rx: &mut broadcast::Receiver<()>,
    ) {
        let mut remaining: HashSet<String> = agents.iter().cloned().collect();
        let subject = phase_complete_subject(&self.run_id);
        let Ok(mut stream) = self.bus.subscribe(&subject).await else {
            tokio::time::sleep(duration).await;
            return;
        };

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        loop {
            if remaining.is_empty() {
                return;
            }
            tokio::select! {
                _ = &mut deadline => return,
                _ = stop_rx.recv() => return,
                maybe_msg = stream.next() => {
                    let Some(msg) = maybe_msg else { return };
                    if let Ok(complete) = serde_json::from_slice::<PhaseCompleteMessage>(&msg.payload) {
                        if complete.phase_id == phase_id {
                            remaining.remove(&complete.agent_id);
                        }
                    }
                }
            }
        }
    }
}

pub fn now_iso() -> chrono::DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;

    #[test]
    fn needs_orchestration_only_for_custom_with_sequential_phase() {
        use crate::model::{RampUpStrategy, RampUpType};

        let immediate = RampUpStrategy::immediate();
        assert!(!needs_orchestration(&immediate));

        let custom_parallel_only = RampUpStrategy {
            strategy_type: RampUpType::Custom,
            duration: "10s".into(),
            phases: vec![RampPhase {
                duration: "10s".into(),
                concurrency: 5,
                mode: PhaseMode::Parallel,
            }],
        };
        assert!(!needs_orchestration(&custom_parallel_only));

        let custom_sequential = RampUpStrategy {
            strategy_type: RampUpType::Custom,
            duration: "10s".into(),
            phases: vec![RampPhase {
                duration: "10s".into(),
                concurrency: 5,
                mode: PhaseMode::Sequential,
            }],
        };
        assert!(needs_orchestration(&custom_sequential));
    }

    #[tokio::test]
    async fn s4_sequential_phase_staggers_agents() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let registry = Registry::new();
        let now = Utc::now();
        registry.register("c", "r", 10, now).await;
        registry.register("a", "r", 10, now).await;
        registry.register("b", "r", 10, now).await;

        let run_id = "run-s4".to_string();
        let orchestrator = PhaseOrchestrator::new(Arc::clone(&bus), Arc::clone(&registry), run_id.clone());

        let mut streams = Vec::new();
        for agent_id in ["a", "b", "c"] {
            streams.push((agent_id, bus.subscribe(&agent_command_subject(agent_id)).await.unwrap()));
        }

        // 900ms / 3 agents = 300ms per-agent slot: a at t=0, b at t=300ms,
        // c at t=600ms, each non-compounding (the S4 scenario, scaled down
        // so the test stays fast).
        let fast_phases = vec![RampPhase {
            duration: "900ms".into(),
            concurrency: 10,
            mode: PhaseMode::Sequential,
        }];
        let per_agent = Duration::from_millis(300);
        let start = tokio::time::Instant::now();

        // Record each agent's receipt time concurrently with `run_all`
        // itself, since `run_all` only returns once the whole phase (and
        // its `wait_for_phase` timer) has elapsed — reading receipt times
        // afterwards would no longer distinguish a compounding schedule
        // from a non-compounding one.
        let mut listeners = Vec::new();
        for (agent_id, mut stream) in streams {
            listeners.push(tokio::spawn(async move {
                let msg = tokio::time::timeout(Duration::from_millis(1200), stream.next())
                    .await
                    .unwrap_or(None);
                (agent_id, start.elapsed(), msg.is_some())
            }));
        }

        orchestrator.run_all(&fast_phases).await;

        let expected = [("a", 0u32), ("b", 1), ("c", 2)];
        for (handle, (expected_id, k)) in listeners.into_iter().zip(expected) {
            let (agent_id, elapsed, received) = handle.await.unwrap();
            assert_eq!(agent_id, expected_id);
            assert!(received, "agent {agent_id} never received START_PHASE");

            // Non-compounding schedule: agent k's slot starts at k * per_agent
            // relative to phase start, not sum(1..=k) * per_agent (the
            // cumulative-delay bug this test guards against).
            let expected_offset = per_agent * k;
            let tolerance = Duration::from_millis(150);
            assert!(
                elapsed + tolerance >= expected_offset && elapsed <= expected_offset + tolerance,
                "agent {agent_id} (k={k}) received START_PHASE at {elapsed:?}, expected ~{expected_offset:?}"
            );
        }
    }
}
