//! Core data model shared by the coordinator and agent binaries: test plans,
//! ramp-up strategies, test runs and the telemetry shapes exchanged over the
//! message bus.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::duration::{format_duration, parse_duration_string};
use crate::errors::AppError;

/// HTTP method an [`Endpoint`] is driven with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
        }
    }
}

/// One HTTP call a worker may issue. Endpoints are round-robined by the
/// worker pool, not picked at random, so a plan with N endpoints gets even
/// coverage of all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<JsonValue>,
    /// Per-endpoint think time, e.g. "500ms". Falls back to the agent's
    /// `default_think_time` when absent or unparseable.
    #[serde(default)]
    pub think_time: Option<String>,
}

/// How agents move from zero to `TestPlan.concurrency` workers over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RampUpType {
    Immediate,
    Linear,
    Step,
    Custom,
}

/// One segment of a `custom` (or synthesised `step`) ramp-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampPhase {
    pub duration: String,
    pub concurrency: u32,
    pub mode: PhaseMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseMode {
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampUpStrategy {
    #[serde(rename = "type")]
    pub strategy_type: RampUpType,
    pub duration: String,
    #[serde(default)]
    pub phases: Vec<RampPhase>,
}

impl RampUpStrategy {
    pub fn immediate() -> Self {
        RampUpStrategy {
            strategy_type: RampUpType::Immediate,
            duration: "0s".to_string(),
            phases: Vec::new(),
        }
    }

    /// Validates shape only; does not parse durations (the ramp calculator
    /// does that lazily and falls back to immediate on failure).
    pub fn validate(&self) -> Result<(), AppError> {
        parse_duration_string(&self.duration)
            .map_err(|e| AppError::Validation(format!("ramp_up_strategy.duration: {e}")))?;
        match self.strategy_type {
            RampUpType::Custom => {
                if self.phases.is_empty() {
                    return Err(AppError::Validation(
                        "custom ramp-up strategy requires at least one phase".into(),
                    ));
                }
            }
            RampUpType::Step => {}
            RampUpType::Immediate | RampUpType::Linear => {}
        }
        for phase in &self.phases {
            parse_duration_string(&phase.duration)
                .map_err(|e| AppError::Validation(format!("phase duration: {e}")))?;
        }
        Ok(())
    }
}

/// Immutable once submitted to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlan {
    pub name: String,
    pub duration: String,
    pub concurrency: u32,
    #[serde(default)]
    pub ramp_up_strategy: Option<RampUpStrategy>,
    pub endpoints: Vec<Endpoint>,
}

impl TestPlan {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("test plan name must not be empty".into()));
        }
        if self.endpoints.is_empty() {
            return Err(AppError::Validation(
                "test plan must have at least one endpoint".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(AppError::Validation("concurrency must be positive".into()));
        }
        parse_duration_string(&self.duration)
            .map_err(|e| AppError::Validation(format!("duration: {e}")))?;
        for endpoint in &self.endpoints {
            reqwest::Url::parse(&endpoint.url)
                .map_err(|e| AppError::Validation(format!("endpoint url '{}': {e}", endpoint.url)))?;
        }
        if let Some(strategy) = &self.ramp_up_strategy {
            strategy.validate()?;
        }
        Ok(())
    }

    pub fn ramp_up(&self) -> RampUpStrategy {
        self.ramp_up_strategy.clone().unwrap_or_else(RampUpStrategy::immediate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestRunStatus {
    Created,
    WaitingForAgents,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl TestRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestRunStatus::Completed | TestRunStatus::Failed | TestRunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    pub region: String,
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub status_codes: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunResults {
    pub total_requests: u64,
    pub total_errors: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub requests_per_sec: f64,
    pub status_codes: HashMap<String, u64>,
    pub agent_results: Vec<AgentResult>,
}

impl TestRunResults {
    /// Combines per-agent rollups into the run-level aggregate. `elapsed_secs`
    /// is `(completed_at - started_at)` in seconds, used for `requests_per_sec`.
    pub fn aggregate(agent_results: Vec<AgentResult>, elapsed_secs: f64) -> Self {
        let total_requests: u64 = agent_results.iter().map(|r| r.requests).sum();
        let total_errors: u64 = agent_results.iter().map(|r| r.errors).sum();

        let mut status_codes: HashMap<String, u64> = HashMap::new();
        for r in &agent_results {
            for (code, count) in &r.status_codes {
                *status_codes.entry(code.clone()).or_insert(0) += count;
            }
        }

        let weighted_latency_sum: f64 = agent_results
            .iter()
            .map(|r| r.avg_latency_ms * r.requests as f64)
            .sum();
        let avg_latency_ms = if total_requests > 0 {
            weighted_latency_sum / total_requests as f64
        } else {
            0.0
        };

        let min_latency_ms = agent_results
            .iter()
            .map(|r| r.min_latency_ms)
            .filter(|v| *v > 0.0)
            .fold(f64::INFINITY, f64::min);
        let min_latency_ms = if min_latency_ms.is_finite() { min_latency_ms } else { 0.0 };

        let max_latency_ms = agent_results
            .iter()
            .map(|r| r.max_latency_ms)
            .fold(0.0f64, f64::max);

        let success_rate = if total_requests == 0 {
            100.0
        } else {
            100.0 * (total_requests.saturating_sub(total_errors)) as f64 / total_requests as f64
        };

        let requests_per_sec = if elapsed_secs > 0.0 {
            total_requests as f64 / elapsed_secs
        } else {
            0.0
        };

        TestRunResults {
            total_requests,
            total_errors,
            success_rate,
            avg_latency_ms,
            min_latency_ms,
            max_latency_ms,
            requests_per_sec,
            status_codes,
            agent_results,
        }
    }
}

/// The run's state record. Mutated only by the Test Run Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub id: String,
    pub name: String,
    pub test_plan: TestPlan,
    pub min_agents: u32,
    pub status: TestRunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration: Option<String>,
    pub results: Option<TestRunResults>,
    #[serde(default)]
    pub parameters: Option<JsonValue>,
}

impl TestRun {
    pub fn new(name: String, test_plan: TestPlan, min_agents: u32, parameters: Option<JsonValue>) -> Self {
        TestRun {
            id: Uuid::new_v4().to_string(),
            name,
            test_plan,
            min_agents,
            status: TestRunStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration: None,
            results: None,
            parameters,
        }
    }

    /// Builds a rerun seed: a fresh `created` run from this (terminal) one's plan.
    pub fn rerun_seed(&self) -> Self {
        TestRun::new(
            format!("{} (Rerun)", self.name),
            self.test_plan.clone(),
            self.min_agents,
            self.parameters.clone(),
        )
    }

    pub fn mark_completed_at(&mut self, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        if let Some(started_at) = self.started_at {
            let elapsed = now.signed_duration_since(started_at);
            self.duration = Some(format_duration(std::time::Duration::from_secs(
                elapsed.num_seconds().max(0) as u64,
            )));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentExecutionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Completed,
}

/// In-memory only; never persisted directly (AgentResult is the persisted
/// per-run view).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub region: String,
    pub concurrency: u32,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub execution_state: AgentExecutionState,
}

impl AgentInfo {
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_seen) > stale_after
    }
}

/// Periodic snapshot published by an agent on `armonite.telemetry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub status_codes: HashMap<String, u64>,
}

impl AgentMetrics {
    pub fn into_agent_result(self, region: String) -> AgentResult {
        AgentResult {
            agent_id: self.agent_id,
            region,
            requests: self.requests,
            errors: self.errors,
            avg_latency_ms: self.avg_latency_ms,
            min_latency_ms: self.min_latency_ms,
            max_latency_ms: self.max_latency_ms,
            status_codes: self.status_codes,
        }
    }
}

/// Registration wire message on `armonite.agent.register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub agent_id: String,
    pub region: String,
    pub concurrency: u32,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub action: RegisterAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterAction {
    Register,
    Unregister,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusMessage {
    pub agent_id: String,
    #[serde(default)]
    pub test_run_id: Option<String>,
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestCommandKind {
    Start,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCommand {
    #[serde(default)]
    pub test_run_id: Option<String>,
    #[serde(default)]
    pub test_plan: Option<TestPlan>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    pub command: TestCommandKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseCommandKind {
    StartPhase,
    StopPhase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCommand {
    pub test_run_id: String,
    pub command: PhaseCommandKind,
    #[serde(default)]
    pub current_phase: Option<PhaseAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseAssignment {
    pub phase_id: String,
    pub index: usize,
    pub mode: PhaseMode,
    pub concurrency: u32,
    pub duration: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCompleteMessage {
    pub agent_id: String,
    pub phase_id: String,
    pub phase_index: usize,
    pub completed_at: DateTime<Utc>,
}
