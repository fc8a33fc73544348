//! Control API: the operator-facing HTTP surface over the coordinator,
//! mounted under `/api/v1`. Every handler delegates straight to
//! [`crate::coordinator::Coordinator`]/[`crate::run_manager::TestRunManager`]
//! and maps [`AppError`] to the response the spec's S6 scenario expects.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;
use crate::duration::parse_duration_string;
use crate::errors::AppError;
use crate::model::{TestPlan, TestRun, TestRunStatus};

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route(
            "/api/v1/test-runs",
            post(create_test_run).get(list_test_runs).delete(bulk_delete_test_runs),
        )
        .route("/api/v1/test-runs/stats", get(stats))
        .route("/api/v1/test-runs/{id}", get(get_test_run).delete(delete_test_run))
        .route("/api/v1/test-runs/{id}/results", get(get_test_run_results))
        .route("/api/v1/test-runs/{id}/start", post(start_test_run))
        .route("/api/v1/test-runs/{id}/stop", post(stop_test_run))
        .route("/api/v1/test-runs/{id}/rerun", post(rerun_test_run))
        .route("/api/v1/test-connection", post(test_connection))
        .route("/api/v1/agents", get(list_agents))
        .route("/api/v1/status", get(status))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(coordinator)
}

/// Wraps [`AppError`] so it can be returned directly from a handler.
struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(e: AppError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct CreateTestRunRequest {
    name: String,
    test_plan: TestPlan,
    #[serde(default = "default_min_agents")]
    min_agents: u32,
    #[serde(default)]
    parameters: Option<serde_json::Value>,
}

fn default_min_agents() -> u32 {
    1
}

async fn create_test_run(
    State(coordinator): State<Arc<Coordinator>>,
    Json(body): Json<CreateTestRunRequest>,
) -> ApiResult<(StatusCode, Json<TestRun>)> {
    let run = coordinator
        .run_manager
        .create(body.name, body.test_plan, body.min_agents, body.parameters)
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn list_test_runs(State(coordinator): State<Arc<Coordinator>>) -> Json<Vec<TestRun>> {
    Json(coordinator.run_manager.list().await)
}

async fn get_test_run(State(coordinator): State<Arc<Coordinator>>, Path(id): Path<String>) -> ApiResult<Json<TestRun>> {
    coordinator
        .run_manager
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError(AppError::NotFound(format!("test run {id} not found"))))
}

async fn get_test_run_results(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<String>,
) -> ApiResult<Json<crate::model::TestRunResults>> {
    let run = coordinator
        .run_manager
        .get(&id)
        .await
        .ok_or_else(|| ApiError(AppError::NotFound(format!("test run {id} not found"))))?;
    run.results
        .map(Json)
        .ok_or_else(|| ApiError(AppError::NotFound(format!("test run {id} has no results yet"))))
}

async fn start_test_run(State(coordinator): State<Arc<Coordinator>>, Path(id): Path<String>) -> ApiResult<Json<TestRun>> {
    Ok(Json(coordinator.run_manager.start(&id).await?))
}

/// S6: stopping a non-active run is a conflict in [`crate::run_manager`]
/// already; deleting an active run additionally reports the run's current
/// status in the body so the client knows why.
async fn stop_test_run(State(coordinator): State<Arc<Coordinator>>, Path(id): Path<String>) -> ApiResult<Json<TestRun>> {
    Ok(Json(coordinator.run_manager.stop(&id).await?))
}

async fn rerun_test_run(State(coordinator): State<Arc<Coordinator>>, Path(id): Path<String>) -> ApiResult<(StatusCode, Json<TestRun>)> {
    let run = coordinator.run_manager.rerun(&id).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn delete_test_run(State(coordinator): State<Arc<Coordinator>>, Path(id): Path<String>) -> Response {
    match coordinator.run_manager.delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(AppError::Conflict(message)) => {
            let status = coordinator
                .run_manager
                .get(&id)
                .await
                .map(|r| format!("{:?}", r.status).to_lowercase())
                .unwrap_or_else(|| "unknown".to_string());
            (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": message, "status": status })),
            )
                .into_response()
        }
        Err(e) => ApiError(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct BulkDeleteRequest {
    #[serde(default)]
    status: Option<TestRunStatus>,
    #[serde(default)]
    older_than: Option<String>,
    #[serde(default)]
    confirm: bool,
}

async fn bulk_delete_test_runs(
    State(coordinator): State<Arc<Coordinator>>,
    Json(body): Json<BulkDeleteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if !body.confirm {
        return Err(ApiError(AppError::Validation(
            "bulk delete requires confirm: true".into(),
        )));
    }
    let older_than: Option<Duration> = body
        .older_than
        .as_deref()
        .map(parse_duration_string)
        .transpose()
        .map_err(|e| ApiError(AppError::Validation(format!("older_than: {e}"))))?;
    let deleted = coordinator.run_manager.bulk_delete(body.status, older_than).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

#[derive(Debug, Serialize)]
struct TestRunStats {
    total: usize,
    running: usize,
    completed: usize,
    failed: usize,
    cancelled: usize,
}

async fn stats(State(coordinator): State<Arc<Coordinator>>) -> Json<TestRunStats> {
    let runs = coordinator.run_manager.list().await;
    let mut stats = TestRunStats {
        total: runs.len(),
        running: 0,
        completed: 0,
        failed: 0,
        cancelled: 0,
    };
    for run in &runs {
        match run.status {
            TestRunStatus::Running | TestRunStatus::WaitingForAgents | TestRunStatus::Completing => stats.running += 1,
            TestRunStatus::Completed => stats.completed += 1,
            TestRunStatus::Failed => stats.failed += 1,
            TestRunStatus::Cancelled => stats.cancelled += 1,
            TestRunStatus::Created => {}
        }
    }
    Json(stats)
}

#[derive(Debug, Deserialize)]
struct TestConnectionRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct TestConnectionResponse {
    reachable: bool,
    status_code: Option<u16>,
    latency_ms: f64,
    error: Option<String>,
}

/// Issues a single `GET` and reports reachability, for the operator to
/// sanity-check an endpoint before submitting a full test plan.
async fn test_connection(Json(body): Json<TestConnectionRequest>) -> Json<TestConnectionResponse> {
    let start = std::time::Instant::now();
    let client = reqwest::Client::new();
    match client.get(&body.url).timeout(Duration::from_secs(10)).send().await {
        Ok(response) => Json(TestConnectionResponse {
            reachable: true,
            status_code: Some(response.status().as_u16()),
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            error: None,
        }),
        Err(e) => Json(TestConnectionResponse {
            reachable: false,
            status_code: None,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            error: Some(e.to_string()),
        }),
    }
}

async fn list_agents(State(coordinator): State<Arc<Coordinator>>) -> Json<Vec<crate::model::AgentInfo>> {
    Json(coordinator.registry.list().await)
}

async fn status(State(coordinator): State<Arc<Coordinator>>) -> Json<crate::coordinator::CoordinatorStatus> {
    Json(coordinator.status_snapshot().await)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn metrics() -> String {
    crate::metrics::encode_text(&crate::metrics::registry())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, MessageBus};
    use crate::model::{Endpoint, HttpMethod};
    use crate::persistence::InMemoryPersistence;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> Router {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let persistence: Arc<dyn crate::persistence::PersistenceAdapter> = Arc::new(InMemoryPersistence::new());
        let coordinator = Coordinator::new(bus, persistence);
        router(coordinator)
    }

    fn plan_body() -> serde_json::Value {
        serde_json::json!({
            "name": "smoke",
            "test_plan": {
                "name": "smoke",
                "duration": "5s",
                "concurrency": 2,
                "endpoints": [{ "method": "GET", "url": "http://example.com" }]
            },
            "min_agents": 1
        })
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let app = app();
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/v1/test-runs")
                    .header("content-type", "application/json")
                    .body(Body::from(plan_body().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let run: TestRun = serde_json::from_slice(&bytes).unwrap();

        let response = app
            .oneshot(Request::get(format!("/api/v1/test-runs/{}", run.id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn s6_delete_active_run_returns_conflict_with_status() {
        let app = app();
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let persistence: Arc<dyn crate::persistence::PersistenceAdapter> = Arc::new(InMemoryPersistence::new());
        let coordinator = Coordinator::new(bus, persistence);
        coordinator.registry.register("a1", "r", 1, chrono::Utc::now()).await;
        let run = coordinator
            .run_manager
            .create(
                "x".into(),
                TestPlan {
                    name: "x".into(),
                    duration: "30s".into(),
                    concurrency: 1,
                    ramp_up_strategy: None,
                    endpoints: vec![Endpoint {
                        method: HttpMethod::Get,
                        url: "http://example.com".into(),
                        headers: Default::default(),
                        body: None,
                        think_time: None,
                    }],
                },
                1,
                None,
            )
            .await
            .unwrap();
        coordinator.run_manager.start(&run.id).await.unwrap();

        let response = router(coordinator)
            .oneshot(
                Request::delete(format!("/api/v1/test-runs/{}", run.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Cannot delete active test run");
        assert_eq!(body["status"], "running");

        let _ = app;
    }

    #[tokio::test]
    async fn bulk_delete_requires_confirm() {
        let app = app();
        let response = app
            .oneshot(
                Request::delete("/api/v1/test-runs")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::json!({ "confirm": false }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = app();
        let response = app.oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
