use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};

use janus_model::{BatchStartRequest, JobInfo};

use crate::AppState;
use crate::errors::{AppError, AppResult};

pub async fn start_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchStartRequest>,
) -> Json<Vec<JobInfo>> {
    Json(state.jobs.start_batch(req).await)
}

pub async fn cancel_batch(State(state): State<AppState>) -> Json<Value> {
    state.jobs.cancel_all();
    Json(json!({ "ok": true }))
}

pub async fn retry_batch(State(state): State<AppState>) -> Json<Vec<JobInfo>> {
    Json(state.jobs.retry_all_failed().await)
}

pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<JobInfo>> {
    Json(state.jobs.list_jobs())
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<JobInfo>> {
    state
        .jobs
        .get_job(&job_id)
        .map(Json)
        .ok_or_else(|| AppError::not_found("Job not found"))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<Value>> {
    if !state.jobs.cancel_job(&job_id) {
        return Err(AppError::not_found("Job not found or already finished"));
    }
    Ok(Json(json!({ "ok": true })))
}

pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<JobInfo>> {
    state
        .jobs
        .retry_job(&job_id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found("Job not found or not in retryable state"))
}

pub async fn eject_cell(
    State(state): State<AppState>,
    Path(cell_id): Path<String>,
) -> AppResult<Json<Value>> {
    let (ok, message) = state.jobs.eject_cell(&cell_id).await;
    if !ok {
        return Err(AppError::bad_request(message));
    }
    Ok(Json(json!({ "ok": true, "message": message })))
}
