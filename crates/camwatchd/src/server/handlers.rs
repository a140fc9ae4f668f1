//! Request handlers and the error-to-response mapping.

use std::collections::HashMap;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use camwatch_core::{CameraId, CameraSpec};

use super::AppState;
use crate::registry::{StartError, StopError, StreamStatus};

/// `{"message": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub message: String,
}

impl MessageBody {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failures surfaced to HTTP clients as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Stop(#[from] StopError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Start(StartError::InvalidSpec(_)) => StatusCode::BAD_REQUEST,
            Self::Start(StartError::AlreadyRunning(_)) => StatusCode::CONFLICT,
            Self::Start(StartError::CapacityExceeded { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Start(StartError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Start(StartError::SourceUnreachable { .. }) => StatusCode::BAD_GATEWAY,
            Self::Stop(StopError::NotFound(_)) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

pub(super) async fn start_stream(
    State(state): State<AppState>,
    payload: Result<Json<CameraSpec>, JsonRejection>,
) -> Result<Json<MessageBody>, ApiError> {
    let Json(camera) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let camera_id = camera.id.clone();

    state.registry.start(camera).await.map_err(|e| {
        warn!(camera_id = %camera_id, error = %e, "Start request failed");
        ApiError::from(e)
    })?;

    Ok(MessageBody::new("Stream started successfully"))
}

pub(super) async fn stop_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageBody>, ApiError> {
    state.registry.stop(&CameraId::new(id)).await?;
    Ok(MessageBody::new("Stream stopped successfully"))
}

pub(super) async fn stream_status(State(state): State<AppState>) -> Json<HashMap<CameraId, StreamStatus>> {
    Json(state.registry.status().await)
}

pub(super) async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}
