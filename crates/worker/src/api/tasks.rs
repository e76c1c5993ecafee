//! Task API handlers: submission, inspection and manual recovery.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use abd_core::bus::task_message;
use abd_core::workflows::process_topic_for;
use abd_core::{
    DispatchError, NewTask, PurgeReport, ReplayReport, StoreError, Task, TaskFilter, TaskStatus,
};

use crate::state::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for submitting a root task
#[derive(Debug, Deserialize)]
pub struct SubmitTaskBody {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

/// Query parameters for listing tasks
#[derive(Debug, Deserialize)]
pub struct ListTasksParams {
    pub topic: Option<String>,
    pub status: Option<String>,
    pub parent: Option<String>,
}

/// Response for listing tasks
#[derive(Debug, Serialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<Task>,
    pub total: usize,
}

/// Request body for replaying failed tasks
#[derive(Debug, Deserialize)]
pub struct ReplayBody {
    pub topic: String,
    #[serde(default)]
    pub with_children: bool,
}

/// Query parameters for purging a book's tasks
#[derive(Debug, Deserialize)]
pub struct PurgeParams {
    pub target_directory: PathBuf,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error returned by task handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::Validation(_)
            | StoreError::InvalidTransition { .. }
            | StoreError::PreconditionFailed { .. } => StatusCode::BAD_REQUEST,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Store(inner) => inner.into(),
            DispatchError::Validation(_)
            | DispatchError::UnknownTopic(_)
            | DispatchError::InvalidPayload { .. } => Self::bad_request(err.to_string()),
            DispatchError::NotFound(_) => Self {
                status: StatusCode::NOT_FOUND,
                message: err.to_string(),
            },
            _ => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: err.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Create a root task and publish it to its worker.
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitTaskBody>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let process_topic = process_topic_for(&body.topic)
        .ok_or_else(|| ApiError::bad_request(format!("no worker handles topic {}", body.topic)))?;

    let task = state
        .store()
        .create(NewTask::pending(body.topic, body.payload))
        .await?;
    let message = task_message(&task).map_err(DispatchError::from)?;
    state
        .bus()
        .emit(process_topic, message)
        .await
        .map_err(DispatchError::from)?;

    info!("Submitted task {} on {}", task.id, task.topic);
    Ok((StatusCode::CREATED, Json(task)))
}

/// List tasks, optionally filtered by topic, status and parent.
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListTasksParams>,
) -> Result<Json<ListTasksResponse>, ApiError> {
    let mut filter = TaskFilter::new();
    if let Some(topic) = params.topic {
        filter = filter.with_topic(topic);
    }
    if let Some(status) = params.status {
        let status = TaskStatus::parse(&status)
            .ok_or_else(|| ApiError::bad_request(format!("unknown status: {}", status)))?;
        filter = filter.with_status(status);
    }
    if let Some(parent) = params.parent {
        filter = filter.with_parent(parent);
    }

    let tasks = state.store().find_all(&filter).await?;
    let total = tasks.len();
    Ok(Json(ListTasksResponse { tasks, total }))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.store().get(&id).await?))
}

/// Reset failed tasks of a topic and republish them.
pub async fn replay_failed(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReplayBody>,
) -> Result<Json<ReplayReport>, ApiError> {
    let report = state
        .maintenance()
        .replay_failed(&body.topic, body.with_children)
        .await?;
    Ok(Json(report))
}

pub async fn republish_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.maintenance().republish(&id).await?))
}

/// Clean up one book: its files and/or its tasks, as configured.
pub async fn purge_tasks(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PurgeParams>,
) -> Result<Json<PurgeReport>, ApiError> {
    let report = state
        .maintenance()
        .purge(&params.target_directory)
        .await
        .inspect_err(|e| warn!("Purge of {} failed: {}", params.target_directory.display(), e))?;
    Ok(Json(report))
}
