//! HTTP request handlers.

use super::AppState;
use crate::db::TestResult;
use crate::runner::RunError;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RunTestsRequest {
    #[serde(default)]
    pub endpoint_ids: Vec<i64>,
    #[serde(default)]
    pub window_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TestAllQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Outcome of a test run, including the persistence audit trail.
#[derive(Debug, Serialize)]
pub struct TestRunResponse {
    pub success: bool,
    pub total_tested: usize,
    pub reachable: usize,
    pub unreachable: usize,
    pub persisted: usize,
    pub status_updates: usize,
    pub results: Vec<TestResult>,
}

// ============================================================================
// Test runs
// ============================================================================

/// POST /api/tests - test the requested endpoints.
pub async fn handle_run_tests(
    State(state): State<AppState>,
    Json(req): Json<RunTestsRequest>,
) -> impl IntoResponse {
    if req.endpoint_ids.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "endpoint_ids must be a non-empty array",
        )
            .into_response();
    }
    if req.window_size == Some(0) {
        return (StatusCode::BAD_REQUEST, "window_size must be positive").into_response();
    }
    let window_size = req.window_size.unwrap_or(state.config.window_size);

    match state.runner.run_ids(&req.endpoint_ids, window_size).await {
        Ok(results) => finish_run(&state, results),
        Err(e) => run_error_response(e),
    }
}

/// GET /api/tests - test every eligible endpoint up to `limit`.
pub async fn handle_test_all(
    State(state): State<AppState>,
    Query(query): Query<TestAllQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50);

    match state
        .runner
        .run_all(Some(limit), state.config.window_size)
        .await
    {
        Ok(results) => finish_run(&state, results),
        Err(e) => run_error_response(e),
    }
}

/// Reconcile a finished run against the database and build the response.
fn finish_run(state: &AppState, results: Vec<TestResult>) -> Response {
    let summary = state.reconciler.reconcile(&results);
    let reachable = results.iter().filter(|r| r.reachable).count();

    Json(TestRunResponse {
        success: true,
        total_tested: results.len(),
        reachable,
        unreachable: results.len() - reachable,
        persisted: summary.persisted,
        status_updates: summary.status_updates,
        results,
    })
    .into_response()
}

fn run_error_response(e: RunError) -> Response {
    match e {
        RunError::NoEndpoints => {
            (StatusCode::NOT_FOUND, "No testable endpoints found").into_response()
        }
        RunError::Db(e) => {
            tracing::error!("Handler: test run failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
