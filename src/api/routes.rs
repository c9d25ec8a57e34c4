//! API route definitions.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use super::state::AppState;
use crate::runlog;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs))
        .route("/runs/{number}", get(run_detail))
        .route("/runs/{number}/log", get(run_log))
        .route("/schedule/next", get(schedule_next))
}

/// Error body in the same envelope as successful responses.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = %e, "API request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "data": null, "error": { "message": self.message } })),
        )
            .into_response()
    }
}

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "job": state.config.job.name,
            "run_active": state.guard.is_active(),
        },
        "meta": meta()
    }))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(20).min(500);
    let runs = state.history.list(limit).await?;
    Ok(Json(json!({
        "data": runs,
        "meta": { "total": runs.len(), "timestamp": Utc::now().to_rfc3339() }
    })))
}

async fn run_detail(
    State(state): State<AppState>,
    Path(number): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let run = state
        .history
        .get(number)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run #{} not found", number)))?;
    let artifacts = state.history.artifacts(number).await?;
    Ok(Json(json!({
        "data": { "run": run, "artifacts": artifacts },
        "meta": meta()
    })))
}

async fn run_log(
    State(state): State<AppState>,
    Path(number): Path<u64>,
) -> Result<Response, ApiError> {
    let run = state
        .history
        .get(number)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run #{} not found", number)))?;
    if !run.log_path.exists() {
        return Err(ApiError::not_found(format!("log of run #{} is gone", number)));
    }
    let text = runlog::read_log(&run.log_path)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        text,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
struct NextParams {
    count: Option<usize>,
}

async fn schedule_next(
    State(state): State<AppState>,
    Query(params): Query<NextParams>,
) -> Json<Value> {
    let count = params.count.unwrap_or(5).clamp(1, 100);
    let upcoming: Vec<String> = state
        .schedule
        .upcoming(Utc::now(), count)
        .iter()
        .map(|t| t.to_rfc3339())
        .collect();
    Json(json!({
        "data": {
            "cron": state.schedule.expression(),
            "timezone": state.schedule.timezone().name(),
            "enabled": state.config.schedule.enabled,
            "upcoming": upcoming,
        },
        "meta": meta()
    }))
}
