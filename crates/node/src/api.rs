//! JSON API handlers. Thin: parse, call into the system, shape the
//! response. All orchestration stays behind `TranscriptionSystem`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use scribe_core::error::TaskError;
use scribe_core::model::WhisperModel;
use scribe_core::task::{OutputFormat, TaskId, TaskPriority, TaskSpec};
use scribe_orchestrator::TranscriptionSystem;

pub type AppState = Arc<TranscriptionSystem>;

fn default_model() -> WhisperModel {
    WhisperModel::Base
}

fn default_formats() -> Vec<OutputFormat> {
    vec![OutputFormat::Plaintext]
}

fn default_priority() -> TaskPriority {
    TaskPriority::Normal
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub files: Vec<String>,
    #[serde(default = "default_model")]
    pub model: WhisperModel,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_formats")]
    pub output_formats: Vec<OutputFormat>,
    #[serde(default = "default_priority")]
    pub priority: TaskPriority,
    #[serde(default)]
    pub preferred_gpu: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub task_id: TaskId,
}

fn task_error_response(error: TaskError) -> (StatusCode, Json<Value>) {
    let status = match error.kind {
        scribe_core::error::TaskErrorKind::InputInvalid => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({
            "error": error.kind.code(),
            "message": error.message,
        })),
    )
}

pub async fn submit_task(
    State(system): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, (StatusCode, Json<Value>)> {
    let spec = TaskSpec {
        files: request.files,
        model: request.model,
        language: request.language,
        output_formats: request.output_formats,
        priority: request.priority,
        preferred_gpu: request.preferred_gpu,
    };
    let task_id = system.submit(spec).map_err(task_error_response)?;
    Ok(Json(SubmitResponse { task_id }))
}

pub async fn task_status(
    State(system): State<AppState>,
    Path(id): Path<TaskId>,
) -> Result<Json<Value>, StatusCode> {
    system
        .status(id)
        .map(|view| Json(json!(view)))
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn cancel_task(State(system): State<AppState>, Path(id): Path<TaskId>) -> Json<Value> {
    let cancelled = system.cancel(id);
    Json(json!({ "cancelled": cancelled }))
}

pub async fn list_queue(State(system): State<AppState>) -> Json<Value> {
    Json(json!(system.list_queue()))
}

pub async fn gpu_status(State(system): State<AppState>) -> Json<Value> {
    Json(json!({
        "devices": system.gpu_status(),
        "pool": system.pool_status(),
        "selector": system.device_choices(),
        "best_gpu": system.best_gpu(),
    }))
}

pub async fn scheduler_status(State(system): State<AppState>) -> Json<Value> {
    Json(json!(system.scheduler_status()))
}

pub async fn kick_scheduler(State(system): State<AppState>) -> Json<Value> {
    system.kick();
    Json(json!({ "kicked": true }))
}

#[derive(Debug, Deserialize)]
pub struct ConcurrencyRequest {
    pub max_concurrent_tasks: usize,
}

pub async fn get_concurrency(State(system): State<AppState>) -> Json<Value> {
    Json(json!({ "max_concurrent_tasks": system.concurrency_get() }))
}

pub async fn set_concurrency(
    State(system): State<AppState>,
    Json(request): Json<ConcurrencyRequest>,
) -> Json<Value> {
    let applied = system.concurrency_set(request.max_concurrent_tasks);
    Json(json!({ "max_concurrent_tasks": applied }))
}

pub async fn list_outputs(
    State(system): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    system
        .output_files()
        .map(|files| Json(json!({ "files": files })))
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "io", "message": e.to_string() })),
            )
        })
}
