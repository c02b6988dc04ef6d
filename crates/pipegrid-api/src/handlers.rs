//! REST API handlers.
//!
//! Each handler reads/writes via `StateStore` and returns JSON responses.
//! Blob reads are the exception: they return the raw bytes.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use tracing::info;

use pipegrid_state::{StateError, WorkloadVersion};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn store_error(e: StateError) -> axum::response::Response {
    let status = match e {
        StateError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

/// One entry of the pipeline listing.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct PipelineEntry {
    pipeline_id: String,
    #[serde(flatten)]
    version: WorkloadVersion,
}

// ── Pipelines ──────────────────────────────────────────────────

/// GET /api/v1/pipelines
pub async fn list_pipelines(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_workload_versions(&state.prefix) {
        Ok(versions) => {
            let entries: Vec<PipelineEntry> = versions
                .into_iter()
                .map(|(pipeline_id, version)| PipelineEntry {
                    pipeline_id,
                    version,
                })
                .collect();
            ApiResponse::ok(entries).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// GET /api/v1/pipelines/{id}/versions
pub async fn list_versions(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.list_versions_for_workload(&state.prefix, &id) {
        Ok(versions) => ApiResponse::ok(versions).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /api/v1/pipelines/{id}/versions/{version}
pub async fn get_version(
    State(state): State<ApiState>,
    Path((id, version)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.get_workload_version(&state.prefix, &id, &version) {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => error_response("version not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => store_error(e),
    }
}

/// PUT /api/v1/pipelines/{id}/versions/{version}
///
/// The path is authoritative for the version string; an empty `key` in the
/// body is filled in from the path id.
pub async fn put_version(
    State(state): State<ApiState>,
    Path((id, version)): Path<(String, String)>,
    Json(mut record): Json<WorkloadVersion>,
) -> impl IntoResponse {
    record.version = version;
    if record.key.is_empty() {
        record.key = id.clone();
    }
    if let Err(e) = record.desired_status() {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response();
    }

    let existed = match state
        .store
        .get_workload_version(&state.prefix, &id, &record.version)
    {
        Ok(existing) => existing.is_some(),
        Err(e) => return store_error(e),
    };

    match state.store.put_workload_version(&state.prefix, &id, &record) {
        Ok(revision) => {
            info!(pipeline_id = %id, version = %record.version, status = %record.status, revision, "pipeline version written");
            let status = if existed {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            let body = serde_json::json!({
                "revision": revision,
                "version": record,
            });
            (status, ApiResponse::ok(body)).into_response()
        }
        Err(e) => store_error(e),
    }
}

/// DELETE /api/v1/pipelines/{id}/versions/{version}
pub async fn delete_version(
    State(state): State<ApiState>,
    Path((id, version)): Path<(String, String)>,
) -> impl IntoResponse {
    match state
        .store
        .delete_workload_version(&state.prefix, &id, &version)
    {
        Ok(true) => {
            info!(pipeline_id = %id, %version, "pipeline version deleted");
            ApiResponse::ok("deleted").into_response()
        }
        Ok(false) => error_response("version not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => store_error(e),
    }
}

// ── Blobs ──────────────────────────────────────────────────────

/// GET /api/v1/blobs/{key}
pub async fn get_blob(State(state): State<ApiState>, Path(key): Path<String>) -> impl IntoResponse {
    match state.store.get_blob(&key) {
        Ok(Some(data)) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response(),
        Ok(None) => error_response("blob not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => store_error(e),
    }
}

/// PUT /api/v1/blobs/{key}
pub async fn put_blob(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    match state.store.put_blob(&key, &body) {
        Ok(()) => ApiResponse::ok(serde_json::json!({
            "key": key,
            "bytes": body.len(),
        }))
        .into_response(),
        Err(e) => store_error(e),
    }
}
