//! `AppError`: the single `IntoResponse` seam every handler funnels its
//! errors through. Validation failures (client's fault) map to 400;
//! everything else is a 500 with the error logged server-side and a
//! generic message returned, per §7's propagation policy — the user only
//! ever learns of transient/internal failure through workflow status, not
//! a raw error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<dwop_core::ParseError> for AppError {
    fn from(err: dwop_core::ParseError) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<dwop_store::StoreError> for AppError {
    fn from(err: dwop_store::StoreError) -> Self {
        match err {
            dwop_store::StoreError::WorkflowNotFound(id) => AppError::NotFound(id.to_string()),
            other => AppError::Internal(anyhow::anyhow!(other)),
        }
    }
}

impl From<dwop_storage::StorageError> for AppError {
    fn from(err: dwop_storage::StorageError) -> Self {
        AppError::Internal(anyhow::anyhow!(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, format!("workflow not found: {msg}")),
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
