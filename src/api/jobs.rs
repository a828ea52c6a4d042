use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::api::error::ErrorKind;
use crate::api::handler_utils::{error_response, ApiObject};
use crate::api::server::AppState;

const RECENT_JOBS_LIMIT: usize = 50;

/// GET /api/jobs/{job_id}
pub async fn get_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiObject<Value> {
    match state.tracker.get(&job_id) {
        Some(record) => (StatusCode::OK, Json(json!({ "ok": true, "job": record }))),
        None => error_response(
            StatusCode::NOT_FOUND,
            ErrorKind::Validation,
            "not_found",
            format!("no job with id {job_id:?}"),
        ),
    }
}

/// GET /api/jobs, newest first.
pub async fn list_jobs_handler(State(state): State<AppState>) -> ApiObject<Value> {
    let jobs = state.tracker.list_recent(RECENT_JOBS_LIMIT);
    (StatusCode::OK, Json(json!({ "ok": true, "jobs": jobs })))
}
