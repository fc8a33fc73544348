//! Agent Control Loop: registers with the coordinator, handles START/STOP
//! and START_PHASE/STOP_PHASE, drives ramp-up, and reports telemetry and
//! heartbeats.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::duration::parse_duration_string;
use crate::model::{
    AgentStatusMessage, HeartbeatMessage, PhaseCommand, PhaseCommandKind, PhaseCompleteMessage, RegisterAction,
    RegisterMessage, TestCommand, TestCommandKind, TestPlan,
};
use crate::orchestrator::{agent_command_subject, phase_complete_subject};
use crate::ramp::RampUpCalculator;
use crate::run_manager::TEST_COMMAND_SUBJECT;
use crate::worker_pool::{WorkerPool, WorkerPoolConfig};

const HEARTBEAT_SUBJECT: &str = "armonite.agent.heartbeat";
const REGISTER_SUBJECT: &str = "armonite.agent.register";
const STATUS_SUBJECT: &str = "armonite.agent.status";
const TELEMETRY_SUBJECT: &str = "armonite.telemetry";

/// Dev-mode ceilings applied before a run starts: caps that only tighten the
/// agent's own flags, never loosen them.
pub struct DevModeCeiling {
    pub max_concurrency: u32,
    pub default_rate_limit: u32,
    pub default_think_time: Duration,
}

impl Default for DevModeCeiling {
    fn default() -> Self {
        DevModeCeiling {
            max_concurrency: 100,
            default_rate_limit: 1000,
            default_think_time: Duration::from_millis(200),
        }
    }
}

pub struct AgentConfig {
    pub agent_id: String,
    pub region: String,
    pub concurrency: u32,
    pub dev_mode: bool,
    pub rate_limit: u32,
    pub default_think_time: Duration,
    pub keep_alive: bool,
}

impl AgentConfig {
    /// Applies the dev-mode ceiling: caps concurrency and only fills in
    /// rate-limit/think-time defaults when the operator left them unset (0 /
    /// zero), per the spec's "explicit flags override only when more
    /// restrictive or when dev-mode value is unset" rule.
    pub fn apply_dev_ceiling(&mut self) {
        if !self.dev_mode {
            return;
        }
        let ceiling = DevModeCeiling::default();
        self.concurrency = self.concurrency.min(ceiling.max_concurrency);
        if self.rate_limit == 0 {
            self.rate_limit = ceiling.default_rate_limit;
        }
        if self.default_think_time.is_zero() {
            self.default_think_time = ceiling.default_think_time;
        }
    }
}

struct RunningState {
    plan: TestPlan,
    run_id: Option<String>,
    stop_tx: watch::Sender<bool>,
    pool: Arc<WorkerPool>,
}

pub struct Agent {
    config: AgentConfig,
    bus: Arc<dyn MessageBus>,
    running: Mutex<Option<RunningState>>,
}

impl Agent {
    pub fn new(config: AgentConfig, bus: Arc<dyn MessageBus>) -> Arc<Self> {
        Arc::new(Agent {
            config,
            bus,
            running: Mutex::new(None),
        })
    }

    /// Registers with the coordinator and starts the background loops
    /// (heartbeat, command subscriptions). Returns once subscriptions are
    /// established; the loops run for the lifetime of the process.
    pub async fn start(self: &Arc<Self>) -> Result<(), crate::errors::AppError> {
        self.publish_register(RegisterAction::Register).await?;
        self.publish_status("idle", "agent registered").await;

        self.spawn_heartbeat_loop();
        self.spawn_test_command_loop().await?;
        self.spawn_phase_command_loop().await?;
        Ok(())
    }

    pub async fn shutdown(self: &Arc<Self>) {
        if let Some(state) = self.running.lock().await.as_ref() {
            let _ = state.stop_tx.send(true);
        }
        let _ = self.publish_register(RegisterAction::Unregister).await;
        let _ = self.bus.close().await;
    }

    async fn publish_register(&self, action: RegisterAction) -> Result<(), crate::errors::AppError> {
        let message = RegisterMessage {
            agent_id: self.config.agent_id.clone(),
            region: self.config.region.clone(),
            concurrency: self.config.concurrency,
            status: "idle".to_string(),
            timestamp: Utc::now(),
            action,
        };
        let payload = serde_json::to_vec(&message).map_err(|e| crate::errors::AppError::Internal(e.to_string()))?;
        self.bus.publish(REGISTER_SUBJECT, &payload).await
    }

    async fn publish_status(&self, status: &str, message: &str) {
        let run_id = self.running.lock().await.as_ref().and_then(|s| s.run_id.clone());
        let status_msg = AgentStatusMessage {
            agent_id: self.config.agent_id.clone(),
            test_run_id: run_id,
            status: status.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        if let Ok(payload) = serde_json::to_vec(&status_msg) {
            if let Err(e) = self.bus.publish(STATUS_SUBJECT, &payload).await {
                warn!(error = %e, "failed to publish agent status");
            }
        }
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>) {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let message = HeartbeatMessage {
                    agent_id: agent.config.agent_id.clone(),
                    timestamp: Utc::now(),
                };
                if let Ok(payload) = serde_json::to_vec(&message) {
                    if let Err(e) = agent.bus.publish(HEARTBEAT_SUBJECT, &payload).await {
                        warn!(error = %e, "failed to publish heartbeat");
                    }
                }
            }
        });
    }

    async fn spawn_test_command_loop(self: &Arc<Self>) -> Result<(), crate::errors::AppError> {
        let mut stream = self.bus.subscribe(TEST_COMMAND_SUBJECT).await?;
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let Ok(command) = serde_json::from_slice::<TestCommand>(&msg.payload) else {
                    continue;
                };
                // A panic inside one command's handling must not kill the loop.
                let agent = Arc::clone(&agent);
                let result = tokio::spawn(async move { agent.handle_test_command(command).await }).await;
                if let Err(e) = result {
                    error!(error = %e, "test command handler panicked");
                }
            }
        });
        Ok(())
    }

    async fn spawn_phase_command_loop(self: &Arc<Self>) -> Result<(), crate::errors::AppError> {
        let subject = agent_command_subject(&self.config.agent_id);
        let mut stream = self.bus.subscribe(&subject).await?;
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let Ok(command) = serde_json::from_slice::<PhaseCommand>(&msg.payload) else {
                    continue;
                };
                let agent = Arc::clone(&agent);
                let result = tokio::spawn(async move { agent.handle_phase_command(command).await }).await;
                if let Err(e) = result {
                    error!(error = %e, "phase command handler panicked");
                }
            }
        });
        Ok(())
    }

    /// A command whose `test_run_id` doesn't match this agent's current run
    /// is silently ignored (idempotent), per the spec's error-handling design.
    fn matches_current_run(running: &Option<RunningState>, test_run_id: &Option<String>) -> bool {
        match (running, test_run_id) {
            (_, None) => true,
            (Some(state), Some(id)) => state.run_id.as_deref() == Some(id.as_str()),
            (None, Some(_)) => false,
        }
    }

    async fn handle_test_command(self: &Arc<Self>, command: TestCommand) {
        match command.command {
            TestCommandKind::Start => self.handle_start(command).await,
            TestCommandKind::Stop => self.handle_stop(command.test_run_id).await,
        }
    }

    async fn handle_start(self: &Arc<Self>, command: TestCommand) {
        {
            let running = self.running.lock().await;
            if running.is_some() {
                return;
            }
        }
        let Some(mut plan) = command.test_plan else {
            warn!("START command missing test_plan, ignoring");
            return;
        };

        let mut config = self.config.concurrency;
        if self.config.dev_mode {
            let mut dev_config = AgentConfig {
                agent_id: self.config.agent_id.clone(),
                region: self.config.region.clone(),
                concurrency: plan.concurrency.min(self.config.concurrency),
                dev_mode: true,
                rate_limit: self.config.rate_limit,
                default_think_time: self.config.default_think_time,
                keep_alive: self.config.keep_alive,
            };
            dev_config.apply_dev_ceiling();
            config = dev_config.concurrency;
            plan.concurrency = plan.concurrency.min(config);
        }

        self.publish_status("starting", "starting test run").await;

        let pool_config = WorkerPoolConfig {
            concurrency: config,
            default_think_time: self.config.default_think_time,
            rate_limit: self.config.rate_limit,
            keep_alive: self.config.keep_alive,
            request_timeout: Duration::from_secs(30),
        };
        let Ok(pool) = WorkerPool::new(plan.endpoints.clone(), &pool_config) else {
            error!("failed to build worker pool");
            return;
        };
        let pool = Arc::new(pool);

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.running.lock().await = Some(RunningState {
            plan: plan.clone(),
            run_id: command.test_run_id.clone(),
            stop_tx,
            pool: Arc::clone(&pool),
        });

        self.publish_status("running", "test run in progress").await;

        let test_duration = parse_duration_string(&plan.duration).unwrap_or(Duration::from_secs(0));
        let max_concurrency = config;
        let strategy = plan.ramp_up();
        let calculator = RampUpCalculator::or_immediate(&strategy, max_concurrency);

        let agent = Arc::clone(self);
        let telemetry_stop = stop_rx.clone();
        tokio::spawn(Agent::spawn_ramp_controller(Arc::clone(&pool), calculator, stop_rx.clone()));
        tokio::spawn(Agent::spawn_telemetry_loop(agent, Arc::clone(&pool), telemetry_stop));

        pool.run(max_concurrency, test_duration, stop_rx).await;

        self.finish_run().await;
    }

    async fn spawn_ramp_controller(pool: Arc<WorkerPool>, calculator: RampUpCalculator, mut stop: watch::Receiver<bool>) {
        let target = pool.target_handle();
        let start = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => return,
            }
            if *stop.borrow() {
                return;
            }
            let elapsed = start.elapsed();
            let current_target = calculator.target_at(elapsed);
            target.store(current_target, Ordering::Relaxed);
            if calculator.is_complete(elapsed) {
                return;
            }
        }
    }

    async fn spawn_telemetry_loop(agent: Arc<Agent>, pool: Arc<WorkerPool>, mut stop: watch::Receiver<bool>) {
        let metrics = pool.metrics();
        for report_index in 0u32.. {
            let interval = if report_index < 3 { Duration::from_secs(2) } else { Duration::from_secs(5) };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => break,
            }
            if *stop.borrow() {
                break;
            }
            agent.publish_telemetry(&metrics).await;
        }
        // Final snapshot on stop, per the spec's "one last telemetry snapshot" rule.
        agent.publish_telemetry(&metrics).await;
    }

    async fn publish_telemetry(&self, metrics: &Arc<Mutex<crate::worker_pool::MetricsState>>) {
        let snapshot = metrics.lock().await.to_metrics(&self.config.agent_id);
        if let Ok(payload) = serde_json::to_vec(&snapshot) {
            if let Err(e) = self.bus.publish(TELEMETRY_SUBJECT, &payload).await {
                warn!(error = %e, "failed to publish telemetry");
            }
        }
    }

    async fn finish_run(self: &Arc<Self>) {
        *self.running.lock().await = None;
        self.publish_status("completed", "test run finished").await;
    }

    async fn handle_stop(self: &Arc<Self>, test_run_id: Option<String>) {
        let running = self.running.lock().await;
        if !Self::matches_current_run(&running, &test_run_id) {
            return;
        }
        let Some(state) = running.as_ref() else { return };
        let _ = state.stop_tx.send(true);
        drop(running);

        self.publish_status("stopping", "stopping on STOP command").await;
    }

    async fn handle_phase_command(self: &Arc<Self>, command: PhaseCommand) {
        let running = self.running.lock().await;
        if !Self::matches_current_run(&running, &Some(command.test_run_id.clone())) {
            return;
        }
        drop(running);

        match command.command {
            PhaseCommandKind::StartPhase => {
                let Some(assignment) = command.current_phase else { return };
                self.run_phase(command.test_run_id, assignment).await;
            }
            PhaseCommandKind::StopPhase => {
                if let Some(state) = self.running.lock().await.as_ref() {
                    let _ = state.stop_tx.send(true);
                }
            }
        }
    }

    async fn run_phase(self: &Arc<Self>, run_id: String, assignment: crate::model::PhaseAssignment) {
        let plan = {
            let running = self.running.lock().await;
            running.as_ref().map(|s| s.plan.clone())
        };
        let Some(plan) = plan else {
            warn!("START_PHASE received with no active plan, ignoring");
            return;
        };

        let pool_config = WorkerPoolConfig {
            concurrency: assignment.concurrency,
            default_think_time: self.config.default_think_time,
            rate_limit: self.config.rate_limit,
            keep_alive: self.config.keep_alive,
            request_timeout: Duration::from_secs(30),
        };
        let Ok(pool) = WorkerPool::new(plan.endpoints.clone(), &pool_config) else {
            error!("failed to build worker pool for phase");
            return;
        };
        let pool = Arc::new(pool);
        let duration = parse_duration_string(&assignment.duration).unwrap_or(Duration::ZERO);

        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut running = self.running.lock().await;
            if let Some(state) = running.as_mut() {
                state.stop_tx = stop_tx;
                state.pool = Arc::clone(&pool);
            }
        }

        pool.run(assignment.concurrency, duration, stop_rx).await;

        let complete = PhaseCompleteMessage {
            agent_id: self.config.agent_id.clone(),
            phase_id: assignment.phase_id,
            phase_index: assignment.index,
            completed_at: Utc::now(),
        };
        if let Ok(payload) = serde_json::to_vec(&complete) {
            if let Err(e) = self.bus.publish(&phase_complete_subject(&run_id), &payload).await {
                warn!(error = %e, "failed to publish phase completion");
            }
        }
    }
}
