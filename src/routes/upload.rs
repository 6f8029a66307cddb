//! Upload Routes
//!
//! HTTP endpoints for the resumable chunked upload protocol.
//!
//! Endpoints:
//! - POST /api/v1/upload/start - Start or resume an upload
//! - POST /api/v1/upload/:session_id/chunks/:index - Upload a chunk (raw body)
//! - POST /api/v1/upload/:session_id/complete - Link the key chain and hand off
//! - POST /api/v1/upload/:session_id/pause - Stop accepting chunks
//! - POST /api/v1/upload/:session_id/resume - Accept chunks again
//! - DELETE /api/v1/upload/:session_id - Cancel upload
//! - GET /api/v1/upload/:session_id/status - Session status
//! - GET /api/v1/upload/:session_id/progress - Weighted progress

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use futures::TryStreamExt;
use serde::Serialize;
use tokio_util::io::StreamReader;

use crate::state::AppState;
use crate::upload::{
    ChunkUploadResponse, CompleteUploadResponse, ProgressResponse, ResumeUploadResponse,
    StartUploadRequest, StartUploadResponse, UploadError, UploadStatusResponse,
};

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Upload request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start", post(start_upload))
        .route(
            "/:session_id/chunks/:index",
            post(upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route("/:session_id/complete", post(complete_upload))
        .route("/:session_id/pause", post(pause_upload))
        .route("/:session_id/resume", post(resume_upload))
        .route("/:session_id", delete(cancel_upload))
        .route("/:session_id/status", get(check_status))
        .route("/:session_id/progress", get(get_progress))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/upload/start
async fn start_upload(
    State(state): State<AppState>,
    Json(request): Json<StartUploadRequest>,
) -> Result<Json<StartUploadResponse>, UploadError> {
    let response = state.engine().start_upload(request).await?;
    Ok(Json(response))
}

/// POST /api/v1/upload/:session_id/chunks/:index
///
/// The chunk is the raw request body. It is streamed to disk, never buffered whole.
async fn upload_chunk(
    State(state): State<AppState>,
    Path((session_id, chunk_index)): Path<(String, usize)>,
    body: Body,
) -> Result<Json<ChunkUploadResponse>, UploadError> {
    let stream = body.into_data_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(stream);

    let response = state
        .engine()
        .upload_chunk(&session_id, chunk_index, reader)
        .await?;
    Ok(Json(response))
}

/// POST /api/v1/upload/:session_id/complete
async fn complete_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<CompleteUploadResponse>, UploadError> {
    let finalized = state.engine().complete_upload(&session_id).await?;

    Ok(Json(CompleteUploadResponse {
        client_id: finalized.client_id,
        file_name: finalized.file_name,
        total_chunks: finalized.total_chunks,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PauseResponse {
    session_id: String,
    paused: bool,
}

/// POST /api/v1/upload/:session_id/pause
async fn pause_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<PauseResponse>, UploadError> {
    state.engine().pause_upload(&session_id)?;
    Ok(Json(PauseResponse {
        session_id,
        paused: true,
    }))
}

/// POST /api/v1/upload/:session_id/resume
async fn resume_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ResumeUploadResponse>, UploadError> {
    Ok(Json(state.engine().resume_upload(&session_id)?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelResponse {
    session_id: String,
    cancelled: bool,
}

/// DELETE /api/v1/upload/:session_id
async fn cancel_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<CancelResponse>, UploadError> {
    if !state.engine().cancel_upload(&session_id) {
        return Err(UploadError::SessionNotFound(session_id));
    }

    Ok(Json(CancelResponse {
        session_id,
        cancelled: true,
    }))
}

/// GET /api/v1/upload/:session_id/status
async fn check_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<UploadStatusResponse>, UploadError> {
    Ok(Json(state.engine().check_status(&session_id)?))
}

/// GET /api/v1/upload/:session_id/progress
async fn get_progress(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ProgressResponse>, UploadError> {
    Ok(Json(state.engine().get_progress(&session_id)?))
}
