//! Persistence abstraction: stores/retrieves test runs and per-agent
//! rollups. The core depends only on the [`PersistenceAdapter`] trait; a
//! SQLite-backed implementation and an in-memory one satisfy it.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::errors::AppError;
use crate::model::{AgentResult, TestRun, TestRunStatus};

#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn save_run(&self, run: &TestRun) -> Result<(), AppError>;
    async fn load_run(&self, id: &str) -> Result<Option<TestRun>, AppError>;
    async fn load_runs(&self) -> Result<Vec<TestRun>, AppError>;
    async fn delete_run(&self, id: &str) -> Result<(), AppError>;
    async fn upsert_agent_result(&self, run_id: &str, result: &AgentResult) -> Result<(), AppError>;
    async fn load_agent_results(&self, run_id: &str) -> Result<Vec<AgentResult>, AppError>;
}

/// `Mutex<HashMap>`-backed adapter used by unit tests and `--dev` mode.
#[derive(Default)]
pub struct InMemoryPersistence {
    runs: Mutex<HashMap<String, TestRun>>,
    agent_results: Mutex<HashMap<String, HashMap<String, AgentResult>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceAdapter for InMemoryPersistence {
    async fn save_run(&self, run: &TestRun) -> Result<(), AppError> {
        self.runs.lock().expect("poisoned").insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, id: &str) -> Result<Option<TestRun>, AppError> {
        Ok(self.runs.lock().expect("poisoned").get(id).cloned())
    }

    async fn load_runs(&self) -> Result<Vec<TestRun>, AppError> {
        Ok(self.runs.lock().expect("poisoned").values().cloned().collect())
    }

    async fn delete_run(&self, id: &str) -> Result<(), AppError> {
        self.runs.lock().expect("poisoned").remove(id);
        self.agent_results.lock().expect("poisoned").remove(id);
        Ok(())
    }

    async fn upsert_agent_result(&self, run_id: &str, result: &AgentResult) -> Result<(), AppError> {
        self.agent_results
            .lock()
            .expect("poisoned")
            .entry(run_id.to_string())
            .or_default()
            .insert(result.agent_id.clone(), result.clone());
        Ok(())
    }

    async fn load_agent_results(&self, run_id: &str) -> Result<Vec<AgentResult>, AppError> {
        Ok(self
            .agent_results
            .lock()
            .expect("poisoned")
            .get(run_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// SQLite-backed adapter matching the two-table schema:
/// `test_runs(id, name, test_plan_json, status, created_at, started_at,
/// completed_at, duration, agent_count, parameters_json, results_json)` and
/// `agent_results(id, test_run_id, agent_id, region, requests, errors,
/// avg_latency_ms, min_latency_ms, max_latency_ms, status_codes_json,
/// updated_at)` indexed on `test_run_id`.
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self, AppError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await
            .map_err(|e| AppError::Persistence(format!("failed to open database at {dsn}: {e}")))?;
        let adapter = SqlitePersistence { pool };
        adapter.migrate().await?;
        Ok(adapter)
    }

    async fn migrate(&self) -> Result<(), AppError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS test_runs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                test_plan_json TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                duration TEXT,
                agent_count INTEGER NOT NULL DEFAULT 0,
                parameters_json TEXT,
                results_json TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Persistence(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_results (
                id TEXT PRIMARY KEY,
                test_run_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                region TEXT NOT NULL,
                requests INTEGER NOT NULL,
                errors INTEGER NOT NULL,
                avg_latency_ms REAL NOT NULL,
                min_latency_ms REAL NOT NULL,
                max_latency_ms REAL NOT NULL,
                status_codes_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Persistence(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_agent_results_run ON agent_results(test_run_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl PersistenceAdapter for SqlitePersistence {
    async fn save_run(&self, run: &TestRun) -> Result<(), AppError> {
        let test_plan_json = serde_json::to_string(&run.test_plan).map_err(|e| AppError::Internal(e.to_string()))?;
        let parameters_json = run
            .parameters
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let results_json = run
            .results
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let status = serde_json::to_value(run.status).map_err(|e| AppError::Internal(e.to_string()))?;
        let status = status.as_str().unwrap_or_default().to_string();

        sqlx::query(
            r#"
            INSERT INTO test_runs
                (id, name, test_plan_json, status, created_at, started_at, completed_at, duration, agent_count, parameters_json, results_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                test_plan_json = excluded.test_plan_json,
                status = excluded.status,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                duration = excluded.duration,
                agent_count = excluded.agent_count,
                parameters_json = excluded.parameters_json,
                results_json = excluded.results_json
            "#,
        )
        .bind(&run.id)
        .bind(&run.name)
        .bind(&test_plan_json)
        .bind(&status)
        .bind(run.created_at.to_rfc3339())
        .bind(run.started_at.map(|t| t.to_rfc3339()))
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .bind(&run.duration)
        .bind(run.min_agents as i64)
        .bind(&parameters_json)
        .bind(&results_json)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Persistence(e.to_string()))?;

        Ok(())
    }

    async fn load_run(&self, id: &str) -> Result<Option<TestRun>, AppError> {
        let row = sqlx::query("SELECT * FROM test_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        row.map(row_to_test_run).transpose()
    }

    async fn load_runs(&self) -> Result<Vec<TestRun>, AppError> {
        let rows = sqlx::query("SELECT * FROM test_runs ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        rows.into_iter().map(row_to_test_run).collect()
    }

    async fn delete_run(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM test_runs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        sqlx::query("DELETE FROM agent_results WHERE test_run_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn upsert_agent_result(&self, run_id: &str, result: &AgentResult) -> Result<(), AppError> {
        let status_codes_json =
            serde_json::to_string(&result.status_codes).map_err(|e| AppError::Internal(e.to_string()))?;
        let id = format!("{run_id}:{}", result.agent_id);
        sqlx::query(
            r#"
            INSERT INTO agent_results
                (id, test_run_id, agent_id, region, requests, errors, avg_latency_ms, min_latency_ms, max_latency_ms, status_codes_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                region = excluded.region,
                requests = excluded.requests,
                errors = excluded.errors,
                avg_latency_ms = excluded.avg_latency_ms,
                min_latency_ms = excluded.min_latency_ms,
                max_latency_ms = excluded.max_latency_ms,
                status_codes_json = excluded.status_codes_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(run_id)
        .bind(&result.agent_id)
        .bind(&result.region)
        .bind(result.requests as i64)
        .bind(result.errors as i64)
        .bind(result.avg_latency_ms)
        .bind(result.min_latency_ms)
        .bind(result.max_latency_ms)
        .bind(&status_codes_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn load_agent_results(&self, run_id: &str) -> Result<Vec<AgentResult>, AppError> {
        let rows = sqlx::query("SELECT * FROM agent_results WHERE test_run_id = ?")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                let status_codes_json: String = row.try_get("status_codes_json").unwrap_or_default();
                Ok(AgentResult {
                    agent_id: row.try_get("agent_id").map_err(sqlx_err)?,
                    region: row.try_get("region").map_err(sqlx_err)?,
                    requests: row.try_get::<i64, _>("requests").map_err(sqlx_err)? as u64,
                    errors: row.try_get::<i64, _>("errors").map_err(sqlx_err)? as u64,
                    avg_latency_ms: row.try_get("avg_latency_ms").map_err(sqlx_err)?,
                    min_latency_ms: row.try_get("min_latency_ms").map_err(sqlx_err)?,
                    max_latency_ms: row.try_get("max_latency_ms").map_err(sqlx_err)?,
                    status_codes: serde_json::from_str(&status_codes_json).unwrap_or_default(),
                })
            })
            .collect()
    }
}

fn sqlx_err(e: sqlx::Error) -> AppError {
    AppError::Persistence(e.to_string())
}

fn row_to_test_run(row: sqlx::sqlite::SqliteRow) -> Result<TestRun, AppError> {
    let test_plan_json: String = row.try_get("test_plan_json").map_err(sqlx_err)?;
    let status_str: String = row.try_get("status").map_err(sqlx_err)?;
    let created_at: String = row.try_get("created_at").map_err(sqlx_err)?;
    let started_at: Option<String> = row.try_get("started_at").map_err(sqlx_err)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(sqlx_err)?;
    let duration: Option<String> = row.try_get("duration").map_err(sqlx_err)?;
    let parameters_json: Option<String> = row.try_get("parameters_json").map_err(sqlx_err)?;
    let results_json: Option<String> = row.try_get("results_json").map_err(sqlx_err)?;

    let status: TestRunStatus =
        serde_json::from_value(serde_json::Value::String(status_str)).map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(TestRun {
        id: row.try_get("id").map_err(sqlx_err)?,
        name: row.try_get("name").map_err(sqlx_err)?,
        test_plan: serde_json::from_str(&test_plan_json).map_err(|e| AppError::Internal(e.to_string()))?,
        min_agents: row.try_get::<i64, _>("agent_count").map_err(sqlx_err)? as u32,
        status,
        created_at: parse_rfc3339(&created_at)?,
        started_at: started_at.map(|s| parse_rfc3339(&s)).transpose()?,
        completed_at: completed_at.map(|s| parse_rfc3339(&s)).transpose()?,
        duration,
        results: results_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))?,
        parameters: parameters_json
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| AppError::Internal(e.to_string()))?,
    })
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Internal(format!("invalid timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, HttpMethod, TestPlan};

    fn sample_plan() -> TestPlan {
        TestPlan {
            name: "smoke".into(),
            duration: "10s".into(),
            concurrency: 5,
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

    #[tokio::test]
    async fn in_memory_round_trips_test_run() {
        let store = InMemoryPersistence::new();
        let run = TestRun::new("smoke".into(), sample_plan(), 1, None);
        store.save_run(&run).await.unwrap();
        let loaded = store.load_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.name, run.name);
    }

    #[tokio::test]
    async fn sqlite_round_trips_test_run() {
        let store = SqlitePersistence::connect("sqlite::memory:", 1).await.unwrap();
        let mut run = TestRun::new("smoke".into(), sample_plan(), 2, None);
        run.status = TestRunStatus::Completed;
        run.started_at = Some(Utc::now());
        run.mark_completed_at(Utc::now());
        store.save_run(&run).await.unwrap();

        let loaded = store.load_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.name, run.name);
        assert_eq!(loaded.status, TestRunStatus::Completed);
        assert_eq!(loaded.min_agents, 2);
    }

    #[tokio::test]
    async fn sqlite_upserts_agent_results() {
        let store = SqlitePersistence::connect("sqlite::memory:", 1).await.unwrap();
        let result = AgentResult {
            agent_id: "agent-1".into(),
            region: "us-east".into(),
            requests: 100,
            errors: 2,
            avg_latency_ms: 12.5,
            min_latency_ms: 1.0,
            max_latency_ms: 99.0,
            status_codes: [("200".to_string(), 98), ("500".to_string(), 2)].into_iter().collect(),
        };
        store.upsert_agent_result("run-1", &result).await.unwrap();
        store.upsert_agent_result("run-1", &result).await.unwrap();

        let results = store.load_agent_results("run-1").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].requests, 100);
    }

    #[tokio::test]
    async fn deleting_a_run_removes_its_agent_results() {
        let store = SqlitePersistence::connect("sqlite::memory:", 1).await.unwrap();
        let run = TestRun::new("smoke".into(), sample_plan(), 1, None);
        store.save_run(&run).await.unwrap();
        let result = AgentResult {
            agent_id: "agent-1".into(),
            region: "us-east".into(),
            ..Default::default()
        };
        store.upsert_agent_result(&run.id, &result).await.unwrap();

        store.delete_run(&run.id).await.unwrap();
        assert!(store.load_run(&run.id).await.unwrap().is_none());
        assert!(store.load_agent_results(&run.id).await.unwrap().is_empty());
    }
}
