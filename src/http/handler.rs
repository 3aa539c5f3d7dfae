//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET  /`                               - JSON index of public repositories
//! - `GET  /{name}`                         - JSON summary of one repository
//! - `GET  /{name}/refs`                    - JSON branches and tags
//! - `GET  /{name}/log/{*reference}`        - JSON commit log of a revision
//! - `GET  /{name}/info/refs`               - Smart HTTP ref advertisement (upload-pack only)
//! - `POST /{name}/git-upload-pack`         - Pack negotiation / data transfer
//! - `POST /{name}/git-receive-pack`        - Always rejected (403), push over SSH
//! - `GET  /{name}/archive/{*reference}`    - Gzipped tarball of a revision
//! - `GET  /healthz`                        - Health check
//! - `GET  /metrics`                        - Prometheus metrics

use std::io::{self, Read};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use flate2::read::GzDecoder;
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::StreamReader;
use tracing::{error, instrument, warn};

use super::transport::run_protocol;
use crate::git::BoxedReader;
use crate::protocol::{sanitize_git_protocol, Operation, RECEIVE_PACK, UPLOAD_PACK};
use crate::AppState;

/// Upper bound for a gzip request body, compressed and inflated.
const MAX_GZIP_BODY: usize = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(super::index::handle_index))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/{name}", get(super::index::handle_summary))
        .route("/{name}/refs", get(super::refs::handle_refs))
        .route("/{name}/log/{*reference}", get(super::refs::handle_log))
        // Git smart HTTP protocol endpoints
        .route("/{name}/info/refs", get(handle_info_refs))
        .route("/{name}/git-upload-pack", post(handle_upload_pack))
        .route("/{name}/git-receive-pack", post(handle_receive_pack))
        .route(
            "/{name}/archive/{*reference}",
            get(super::archive::handle_archive),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /{name}/info/refs?service=git-upload-pack`
#[instrument(skip(state, headers), fields(%name))]
async fn handle_info_refs(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    match query.service.as_deref() {
        Some(UPLOAD_PACK) => {}
        Some(RECEIVE_PACK) => {
            warn!("rejected receive-pack discovery over HTTP");
            return Err(AppError::BadRequest(
                "Pushing over HTTP is not supported. Push over SSH instead.".into(),
            ));
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "Unsupported service: {}",
                other.unwrap_or("")
            )));
        }
    }

    Ok(run_protocol(
        &state,
        name,
        Operation::AdvertiseRefs,
        git_protocol(&headers),
        None,
    )
    .await)
}

/// `POST /{name}/git-upload-pack`
///
/// The request body is streamed into `git upload-pack --stateless-rpc`;
/// its output is streamed back chunk by chunk.
#[instrument(skip(state, headers, body), fields(%name))]
async fn handle_upload_pack(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let input = request_body(&headers, body).await?;
    Ok(run_protocol(
        &state,
        name,
        Operation::UploadPack,
        git_protocol(&headers),
        Some(input),
    )
    .await)
}

/// `POST /{name}/git-receive-pack`
///
/// HTTP callers are never authorized to push, whatever the repository.
#[instrument(skip(_state))]
async fn handle_receive_pack(
    State(_state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    warn!(%name, "rejected git-receive-pack (push) over HTTP");
    (
        StatusCode::FORBIDDEN,
        "Pushing over HTTP is not supported. Push over SSH instead.\n",
    )
        .into_response()
}

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    crate::health::health_handler(State(Arc::clone(&state.config))).await
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn git_protocol(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Git-Protocol")
        .and_then(|v| v.to_str().ok())
        .and_then(sanitize_git_protocol)
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip"))
}

/// The request body as git's stdin.  Plain bodies are streamed as they
/// arrive; gzip bodies are inflated up front.
async fn request_body(headers: &HeaderMap, body: Body) -> Result<BoxedReader, AppError> {
    if !is_gzip(headers) {
        let stream = body.into_data_stream().map_err(io::Error::other);
        return Ok(Box::new(StreamReader::new(stream)));
    }

    let compressed = axum::body::to_bytes(body, MAX_GZIP_BODY)
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to read request body: {e}")))?;
    let inflated = tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        GzDecoder::new(&compressed[..])
            .take(MAX_GZIP_BODY as u64)
            .read_to_end(&mut out)
            .map(|_| out)
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))?
    .map_err(|e| AppError::BadRequest(format!("invalid gzip body: {e}")))?;

    Ok(Box::new(io::Cursor::new(inflated)))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Missing, private, or otherwise hidden repository.
    NotFound,
    BadRequest(String),
    /// An unexpected internal error.  Details are logged, not returned.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound => (StatusCode::NOT_FOUND, "Repository not found.").into_response(),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Unexpected server error.").into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
