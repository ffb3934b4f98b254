//! HTTP submission surface: `GET /health`, `POST /upload`, `POST /update`,
//! `POST /cancel`. JSON everywhere; errors are `{"error": "<message>"}`
//! via [`AppError`].

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use dwop_queue::WorkflowCanceler;
use dwop_storage::BlobStore;
use dwop_store::WorkflowStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::AppError;
use crate::submission::{submit_workflow, WorkflowDescriptor};

/// Multipart/body size cap for `/upload` and `/update`, per the external
/// interfaces contract.
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkflowStore>,
    pub storage: Arc<dyn BlobStore>,
    pub canceler: Arc<dyn WorkflowCanceler>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route(
            "/update",
            post(update).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/cancel", post(cancel))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// A decoded `multipart/form-data` body with the `file` and `requirements`
/// fields the upload/update endpoints share.
struct SubmissionParts {
    source: String,
    requirements: Vec<u8>,
}

async fn read_submission_parts(mut multipart: Multipart) -> Result<SubmissionParts, AppError> {
    let mut file: Option<Vec<u8>> = None;
    let mut requirements: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(format!("failed to read field {name:?}: {e}")))?;
        match name.as_str() {
            "file" => file = Some(bytes.to_vec()),
            "requirements" => requirements = Some(bytes.to_vec()),
            _ => {}
        }
    }

    let file = file.ok_or_else(|| AppError::Validation("missing multipart field `file`".into()))?;
    let requirements = requirements
        .ok_or_else(|| AppError::Validation("missing multipart field `requirements`".into()))?;
    let source = String::from_utf8(file)
        .map_err(|e| AppError::Validation(format!("source file is not valid UTF-8: {e}")))?;

    Ok(SubmissionParts { source, requirements })
}

async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<WorkflowDescriptor>, AppError> {
    let parts = read_submission_parts(multipart).await?;
    let descriptor =
        submit_workflow(&state.store, &state.storage, &parts.source, parts.requirements).await?;
    Ok(Json(descriptor))
}

#[derive(Deserialize)]
struct WorkflowIdQuery {
    #[serde(rename = "workflowId")]
    workflow_id: Option<Uuid>,
}

async fn update(
    State(state): State<AppState>,
    Query(query): Query<WorkflowIdQuery>,
    mut multipart: Multipart,
) -> Result<Json<WorkflowDescriptor>, AppError> {
    // `workflowId` may arrive as a query param or as a multipart form
    // field; accumulate fields first so either shape works.
    let mut workflow_id = query.workflow_id;
    let mut file: Option<Vec<u8>> = None;
    let mut requirements: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "workflowId" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("invalid workflowId field: {e}")))?;
                workflow_id = Some(
                    text.parse()
                        .map_err(|e| AppError::Validation(format!("invalid workflowId: {e}")))?,
                );
            }
            "file" => {
                file = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AppError::Validation(format!("failed to read `file`: {e}")))?
                        .to_vec(),
                )
            }
            "requirements" => {
                requirements = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| {
                            AppError::Validation(format!("failed to read `requirements`: {e}"))
                        })?
                        .to_vec(),
                )
            }
            _ => {}
        }
    }

    let workflow_id = workflow_id
        .ok_or_else(|| AppError::Validation("missing workflowId".to_string()))?;
    let file = file.ok_or_else(|| AppError::Validation("missing multipart field `file`".into()))?;
    let requirements = requirements
        .ok_or_else(|| AppError::Validation("missing multipart field `requirements`".into()))?;
    let source = String::from_utf8(file)
        .map_err(|e| AppError::Validation(format!("source file is not valid UTF-8: {e}")))?;

    // Cancel the existing workflow, then submit the replacement — Update
    // is Cancel-then-submit, per §4.8.
    state.store.cancel_workflow(workflow_id).await?;
    state.canceler.force_stop(workflow_id).await;

    let descriptor = submit_workflow(&state.store, &state.storage, &source, requirements).await?;
    Ok(Json(descriptor))
}

#[derive(Deserialize)]
struct CancelRequest {
    #[serde(rename = "workflowId")]
    workflow_id: Uuid,
}

async fn cancel(
    State(state): State<AppState>,
    Query(query): Query<WorkflowIdQuery>,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let workflow_id = if let Some(id) = query.workflow_id {
        id
    } else if !body.is_empty() {
        let req: CancelRequest = serde_json::from_slice(&body)
            .map_err(|e| AppError::Validation(format!("invalid cancel request body: {e}")))?;
        req.workflow_id
    } else {
        return Err(AppError::Validation("missing workflowId".to_string()));
    };

    state.store.cancel_workflow(workflow_id).await?;
    state.canceler.force_stop(workflow_id).await;
    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use dwop_storage::SupabaseBlobStore;
    use dwop_store::InMemoryStore;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        struct NoopCanceler;
        #[async_trait::async_trait]
        impl WorkflowCanceler for NoopCanceler {
            async fn force_stop(&self, _workflow_id: Uuid) {}
        }
        AppState {
            store: Arc::new(InMemoryStore::new()),
            storage: Arc::new(SupabaseBlobStore::new("https://proj.example.co", "key")),
            canceler: Arc::new(NoopCanceler),
        }
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = router(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_on_post_route_is_method_not_allowed() {
        let app = router(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/upload").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn cancel_without_workflow_id_is_bad_request() {
        let app = router(test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
