//! Test Run Manager: single-writer lifecycle state machine for `TestRun`.
//! Owns the phase orchestrator by value for the lifetime of a single run
//! (per Design Notes) and is the only component permitted to mutate a
//! `TestRun`'s status.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{error, info};

use crate::aggregator::TelemetryAggregator;
use crate::bus::MessageBus;
use crate::duration::parse_duration_string;
use crate::errors::AppError;
use crate::metrics::COORDINATOR_ACTIVE_RUNS;
use crate::model::{TestCommand, TestCommandKind, TestPlan, TestRun, TestRunResults, TestRunStatus};
use crate::orchestrator::{needs_orchestration, PhaseOrchestrator};
use crate::persistence::PersistenceAdapter;
use crate::registry::Registry;

pub const TEST_COMMAND_SUBJECT: &str = "armonite.test.command";

struct Inner {
    runs: HashMap<String, TestRun>,
    current_run_id: Option<String>,
    active_orchestrator: Option<Arc<PhaseOrchestrator>>,
}

pub struct TestRunManager {
    bus: Arc<dyn MessageBus>,
    persistence: Arc<dyn PersistenceAdapter>,
    registry: Arc<Registry>,
    aggregator: Arc<TelemetryAggregator>,
    inner: Mutex<Inner>,
}

impl TestRunManager {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        persistence: Arc<dyn PersistenceAdapter>,
        registry: Arc<Registry>,
        aggregator: Arc<TelemetryAggregator>,
    ) -> Arc<Self> {
        Arc::new(TestRunManager {
            bus,
            persistence,
            registry,
            aggregator,
            inner: Mutex::new(Inner {
                runs: HashMap::new(),
                current_run_id: None,
                active_orchestrator: None,
            }),
        })
    }

    /// Loads persisted runs into memory at startup (does not resume a
    /// non-terminal run's execution — it is left as-is for the operator to
    /// inspect; only terminal runs are expected to survive a restart in
    /// practice).
    pub async fn load_from_persistence(&self) -> Result<(), AppError> {
        let runs = self.persistence.load_runs().await?;
        let mut inner = self.inner.lock().await;
        for run in runs {
            if !run.status.is_terminal() {
                inner.current_run_id.get_or_insert_with(|| run.id.clone());
            }
            inner.runs.insert(run.id.clone(), run);
        }
        Ok(())
    }

    pub async fn create(&self, name: String, plan: TestPlan, min_agents: u32, parameters: Option<serde_json::Value>) -> Result<TestRun, AppError> {
        if min_agents == 0 {
            return Err(AppError::Validation("min_agents must be positive".into()));
        }
        plan.validate()?;

        let run = TestRun::new(name, plan, min_agents, parameters);
        self.persistence.save_run(&run).await?;
        self.inner.lock().await.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    pub async fn get(&self, id: &str) -> Option<TestRun> {
        self.inner.lock().await.runs.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<TestRun> {
        self.inner.lock().await.runs.values().cloned().collect()
    }

    /// Starts a run from `created`. Requires no other run is currently
    /// non-terminal. Transitions straight to `running` if quorum is already
    /// met, else to `waiting_for_agents`.
    pub async fn start(self: &Arc<Self>, id: &str) -> Result<TestRun, AppError> {
        let mut inner = self.inner.lock().await;

        if let Some(other_id) = &inner.current_run_id {
            if other_id != id {
                return Err(AppError::Conflict(format!(
                    "another run ({other_id}) is already active"
                )));
            }
        }

        let run = inner
            .runs
            .get(id)
            .ok_or_else(|| AppError::NotFound(format!("test run {id} not found")))?
            .clone();

        if run.status != TestRunStatus::Created {
            return Err(AppError::Conflict(format!(
                "run {id} cannot be started from status {:?}",
                run.status
            )));
        }

        inner.current_run_id = Some(id.to_string());
        drop(inner);

        let agent_count = self.registry.count().await as u32;
        if agent_count >= run.min_agents {
            self.transition_to_running(id).await
        } else {
            let mut inner = self.inner.lock().await;
            if let Some(r) = inner.runs.get_mut(id) {
                r.status = TestRunStatus::WaitingForAgents;
            }
            let run = inner.runs.get(id).cloned().unwrap();
            drop(inner);
            self.persistence.save_run(&run).await?;
            info!(run_id = %id, agents = agent_count, min_agents = run.min_agents, "waiting for agent quorum");
            Ok(run)
        }
    }

    /// Called by the registry's registration handler whenever an agent joins
    /// while a run is `waiting_for_agents`, to re-check quorum.
    pub async fn check_quorum(self: &Arc<Self>) {
        let run_id = {
            let inner = self.inner.lock().await;
            match &inner.current_run_id {
                Some(id) => id.clone(),
                None => return,
            }
        };
        let waiting = {
            let inner = self.inner.lock().await;
            inner
                .runs
                .get(&run_id)
                .map(|r| r.status == TestRunStatus::WaitingForAgents)
                .unwrap_or(false)
        };
        if !waiting {
            return;
        }
        let min_agents = {
            let inner = self.inner.lock().await;
            inner.runs.get(&run_id).map(|r| r.min_agents).unwrap_or(u32::MAX)
        };
        if self.registry.count().await as u32 >= min_agents {
            if let Err(e) = self.transition_to_running(&run_id).await {
                error!(run_id = %run_id, error = %e, "failed to transition run to running");
            }
        }
    }

    async fn transition_to_running(self: &Arc<Self>, id: &str) -> Result<TestRun, AppError> {
        let started_at = Utc::now();
        let run = {
            let mut inner = self.inner.lock().await;
            let run = inner
                .runs
                .get_mut(id)
                .ok_or_else(|| AppError::NotFound(format!("test run {id} not found")))?;
            run.status = TestRunStatus::Running;
            run.started_at = Some(started_at);
            run.clone()
        };

        self.persistence.save_run(&run).await?;
        self.aggregator.set_current_run(Some(run.id.clone())).await;
        self.aggregator.start_run(&run.id).await;
        COORDINATOR_ACTIVE_RUNS.set(1.0);

        let strategy = run.test_plan.ramp_up();
        if needs_orchestration(&strategy) {
            self.spawn_orchestrated(&run, &strategy).await;
        } else {
            self.broadcast_start(&run).await?;
            self.spawn_completion_timer(run.id.clone(), run.test_plan.duration.clone());
        }

        info!(run_id = %run.id, "test run started");
        Ok(run)
    }

    async fn broadcast_start(&self, run: &TestRun) -> Result<(), AppError> {
        let command = TestCommand {
            test_run_id: Some(run.id.clone()),
            test_plan: Some(run.test_plan.clone()),
            start_time: Some(Utc::now()),
            command: TestCommandKind::Start,
        };
        let payload = serde_json::to_vec(&command).map_err(|e| AppError::Internal(e.to_string()))?;
        self.bus.publish(TEST_COMMAND_SUBJECT, &payload).await
    }

    async fn spawn_orchestrated(self: &Arc<Self>, run: &TestRun, strategy: &crate::model::RampUpStrategy) {
        let orchestrator = Arc::new(PhaseOrchestrator::new(
            Arc::clone(&self.bus),
            Arc::clone(&self.registry),
            run.id.clone(),
        ));
        self.inner.lock().await.active_orchestrator = Some(Arc::clone(&orchestrator));

        // Still broadcast START so agents mark themselves running and know the
        // plan's endpoints, even though concurrency is phase-driven.
        if let Err(e) = self.broadcast_start(run).await {
            error!(run_id = %run.id, error = %e, "failed to broadcast start for orchestrated run");
        }

        let phases = strategy.phases.clone();
        let manager = Arc::clone(self);
        let run_id = run.id.clone();
        let plan_duration = run.test_plan.duration.clone();
        tokio::spawn(async move {
            orchestrator.run_all(&phases).await;
            manager.finalize(&run_id).await.unwrap_or_else(|e| {
                error!(run_id = %run_id, error = %e, "finalisation failed after orchestration");
            });
            let _ = plan_duration;
        });
    }

    fn spawn_completion_timer(self: &Arc<Self>, run_id: String, plan_duration: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let duration = parse_duration_string(&plan_duration).unwrap_or(Duration::from_secs(0));
            tokio::time::sleep(duration).await;
            if let Err(e) = manager.finalize(&run_id).await {
                error!(run_id = %run_id, error = %e, "finalisation failed after completion timer");
            }
        });
    }

    /// Stops a run from `running` or `waiting_for_agents`. Idempotent: a
    /// second stop on an already-`completing`/terminal run is a no-op.
    pub async fn stop(self: &Arc<Self>, id: &str) -> Result<TestRun, AppError> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("test run {id} not found")))?;

        if run.status.is_terminal() || run.status == TestRunStatus::Completing {
            return Ok(run.clone());
        }
        if !matches!(run.status, TestRunStatus::Running | TestRunStatus::WaitingForAgents) {
            return Err(AppError::Conflict(format!(
                "run {id} cannot be stopped from status {:?}",
                run.status
            )));
        }

        run.status = TestRunStatus::Completing;
        let run = run.clone();
        let orchestrator = inner.active_orchestrator.take();
        drop(inner);

        if let Some(orchestrator) = orchestrator {
            orchestrator.stop().await;
        }

        if let Err(e) = self.persistence.save_run(&run).await {
            error!(run_id = %id, error = %e, "failed to persist stop transition; continuing with in-memory state");
        }

        let command = TestCommand {
            test_run_id: Some(run.id.clone()),
            test_plan: None,
            start_time: None,
            command: TestCommandKind::Stop,
        };
        if let Ok(payload) = serde_json::to_vec(&command) {
            if let Err(e) = self.bus.publish(TEST_COMMAND_SUBJECT, &payload).await {
                error!(run_id = %id, error = %e, "failed to broadcast stop command");
            }
        }

        self.finalize(id).await
    }

    /// Snapshots results, computes the aggregate, marks the run `completed`,
    /// persists and clears the current-run pointer. Safe to call more than
    /// once (idempotent): a run already terminal is returned unchanged.
    pub async fn finalize(self: &Arc<Self>, id: &str) -> Result<TestRun, AppError> {
        let mut inner = self.inner.lock().await;
        let Some(run) = inner.runs.get(id).cloned() else {
            return Err(AppError::NotFound(format!("test run {id} not found")));
        };
        if run.status.is_terminal() {
            return Ok(run);
        }
        inner.active_orchestrator = None;
        if inner.current_run_id.as_deref() == Some(id) {
            inner.current_run_id = None;
        }
        drop(inner);

        let agent_results = self.aggregator.snapshot(id).await;
        let completed_at = Utc::now();
        let elapsed_secs = run
            .started_at
            .map(|s| completed_at.signed_duration_since(s).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        let results = TestRunResults::aggregate(agent_results, elapsed_secs);

        let mut run = run;
        run.status = TestRunStatus::Completed;
        run.mark_completed_at(completed_at);
        run.results = Some(results);

        if let Err(e) = self.persistence.save_run(&run).await {
            error!(run_id = %id, error = %e, "failed to persist completed run; in-memory state remains authoritative");
        }

        self.aggregator.set_current_run(None).await;
        self.aggregator.clear_run(id).await;
        COORDINATOR_ACTIVE_RUNS.set(0.0);

        self.inner.lock().await.runs.insert(id.to_string(), run.clone());
        info!(run_id = %id, total_requests = run.results.as_ref().map(|r| r.total_requests).unwrap_or(0), "test run completed");
        Ok(run)
    }

    /// Creates a new `created` run from a terminal one's plan, named "(Rerun)", then starts it.
    pub async fn rerun(self: &Arc<Self>, id: &str) -> Result<TestRun, AppError> {
        let source = self
            .get(id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("test run {id} not found")))?;
        if !source.status.is_terminal() {
            return Err(AppError::Conflict(format!("run {id} is not terminal; cannot rerun")));
        }
        let seed = source.rerun_seed();
        self.persistence.save_run(&seed).await?;
        self.inner.lock().await.runs.insert(seed.id.clone(), seed.clone());
        self.start(&seed.id).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        let run = self
            .get(id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("test run {id} not found")))?;
        if !run.status.is_terminal() {
            return Err(AppError::Conflict("Cannot delete active test run".to_string()));
        }
        self.persistence.delete_run(id).await?;
        self.inner.lock().await.runs.remove(id);
        Ok(())
    }

    /// Bulk delete by status or by age. Requires the caller to have already
    /// checked `confirm: true` at the API layer.
    pub async fn bulk_delete(&self, status: Option<TestRunStatus>, older_than: Option<Duration>) -> Result<usize, AppError> {
        let now = Utc::now();
        let targets: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .runs
                .values()
                .filter(|r| r.status.is_terminal())
                .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
                .filter(|r| {
                    older_than
                        .map(|d| now.signed_duration_since(r.created_at).num_seconds() as u64 > d.as_secs())
                        .unwrap_or(true)
                })
                .map(|r| r.id.clone())
                .collect()
        };
        for id in &targets {
            self.delete(id).await?;
        }
        Ok(targets.len())
    }

    pub async fn current_run_id(&self) -> Option<String> {
        self.inner.lock().await.current_run_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::model::{Endpoint, HttpMethod};
    use crate::persistence::InMemoryPersistence;

    fn sample_plan(duration: &str) -> TestPlan {
        TestPlan {
            name: "smoke".into(),
            duration: duration.into(),
            concurrency: 2,
            ramp_up_strategy: None,
            endpoints: vec![Endpoint {
                method: HttpMethod::Get,
                url: "http://example.com".into(),
                headers: Default::default(),
                body: None,
                think_time: None,
            }],
        }
    }

    fn manager() -> (Arc<TestRunManager>, Arc<Registry>, Arc<TelemetryAggregator>) {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let persistence: Arc<dyn PersistenceAdapter> = Arc::new(InMemoryPersistence::new());
        let registry = Registry::new();
        let aggregator = TelemetryAggregator::new(Arc::clone(&persistence));
        let manager = TestRunManager::new(bus, persistence, Arc::clone(&registry), Arc::clone(&aggregator));
        (manager, registry, aggregator)
    }

    #[tokio::test]
    async fn create_validates_plan() {
        let (manager, _, _) = manager();
        let bad_plan = TestPlan {
            endpoints: vec![],
            ..sample_plan("1s")
        };
        let err = manager.create("x".into(), bad_plan, 1, None).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn s2_waits_for_quorum_then_starts() {
        let (manager, registry, _) = manager();
        registry.register("a1", "r", 1, Utc::now()).await;
        registry.register("a2", "r", 1, Utc::now()).await;

        let run = manager.create("x".into(), sample_plan("1s"), 3, None).await.unwrap();
        let run = manager.start(&run.id).await.unwrap();
        assert_eq!(run.status, TestRunStatus::WaitingForAgents);

        registry.register("a3", "r", 1, Utc::now()).await;
        manager.check_quorum().await;

        let run = manager.get(&run.id).await.unwrap();
        assert_eq!(run.status, TestRunStatus::Running);
    }

    #[tokio::test]
    async fn only_one_non_terminal_run_allowed() {
        let (manager, registry, _) = manager();
        registry.register("a1", "r", 1, Utc::now()).await;

        let run1 = manager.create("x".into(), sample_plan("2s"), 1, None).await.unwrap();
        manager.start(&run1.id).await.unwrap();

        let run2 = manager.create("y".into(), sample_plan("2s"), 1, None).await.unwrap();
        let err = manager.start(&run2.id).await;
        assert!(matches!(err, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (manager, registry, _) = manager();
        registry.register("a1", "r", 1, Utc::now()).await;
        let run = manager.create("x".into(), sample_plan("30s"), 1, None).await.unwrap();
        manager.start(&run.id).await.unwrap();

        let stopped_once = manager.stop(&run.id).await.unwrap();
        assert_eq!(stopped_once.status, TestRunStatus::Completed);

        let stopped_twice = manager.stop(&run.id).await.unwrap();
        assert_eq!(stopped_twice.status, stopped_once.status);
        assert_eq!(stopped_twice.completed_at, stopped_once.completed_at);
    }

    #[tokio::test]
    async fn delete_active_run_is_conflict() {
        let (manager, registry, _) = manager();
        registry.register("a1", "r", 1, Utc::now()).await;
        let run = manager.create("x".into(), sample_plan("30s"), 1, None).await.unwrap();
        manager.start(&run.id).await.unwrap();

        let err = manager.delete(&run.id).await;
        assert!(matches!(err, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn rerun_requires_terminal_source() {
        let (manager, registry, _) = manager();
        registry.register("a1", "r", 1, Utc::now()).await;
        let run = manager.create("x".into(), sample_plan("30s"), 1, None).await.unwrap();
        manager.start(&run.id).await.unwrap();

        let err = manager.rerun(&run.id).await;
        assert!(matches!(err, Err(AppError::Conflict(_))));

        manager.stop(&run.id).await.unwrap();
        let rerun = manager.rerun(&run.id).await.unwrap();
        assert!(rerun.name.ends_with("(Rerun)"));
    }

    #[tokio::test]
    async fn completion_timer_finalizes_run() {
        let (manager, registry, _) = manager();
        registry.register("a1", "r", 1, Utc::now()).await;
        let run = manager.create("x".into(), sample_plan("1s"), 1, None).await.unwrap();
        manager.start(&run.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1300)).await;
        let run = manager.get(&run.id).await.unwrap();
        assert_eq!(run.status, TestRunStatus::Completed);
        assert!(run.completed_at.is_some());
        assert!(run.started_at.unwrap() <= run.completed_at.unwrap());
    }
}
