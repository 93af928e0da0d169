use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use log::error;
use serde_json::json;

use crate::db::store::StorageError;
use crate::services::sync::SyncError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("sync is disabled: SQ_INSIGHTS_API_KEY is not configured")]
    SyncDisabled,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("background task failed: {0}")]
    Task(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::SyncDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Sync(SyncError::AlreadyRunning) => StatusCode::CONFLICT,
            ApiError::Sync(_) | ApiError::Storage(_) | ApiError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API: {} ({})", self, status);
        }
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}
