//! HTTP surface for the upload trigger and status query.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/documents` | Upload trigger; returns `202` with the submission |
//! | `GET`  | `/documents/{ref}/status` | Status of the document's current attempt |
//!
//! A claimed submission is processed on a background task; the response does
//! not wait for it. Poll the status endpoint for the outcome.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "no document with ref: inv-9" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::PipelineError;
use crate::gateway::{StatusReport, Submission};
use crate::models::{DocumentType, UploadEvent};
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
}

/// Start the server on `[server].bind`. Runs until the process is terminated.
pub async fn run_server(config: &Config, orchestrator: Orchestrator) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(orchestrator);

    info!(bind = %bind_addr, "http server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(orchestrator: Orchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/documents", post(handle_submit))
        .route("/documents/{document_ref}/status", get(handle_status))
        .layer(cors)
        .with_state(AppState { orchestrator })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotFound(message) => not_found(message),
            PipelineError::ConcurrencyConflict { .. } | PipelineError::StaleState { .. } => {
                AppError {
                    status: StatusCode::CONFLICT,
                    code: "conflict",
                    message: err.to_string(),
                }
            }
            other => AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal",
                message: other.to_string(),
            },
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /documents ============

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    document_ref: String,
    #[serde(default)]
    document_type: Option<String>,
    #[serde(default)]
    force: bool,
    /// Defaults to the time the request arrives.
    #[serde(default)]
    uploaded_at: Option<DateTime<Utc>>,
}

/// Record the upload and hand a claimed attempt to a background task.
async fn handle_submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Submission>), AppError> {
    if req.document_ref.trim().is_empty() {
        return Err(bad_request("document_ref must not be empty"));
    }
    let document_type = req
        .document_type
        .as_deref()
        .map(str::parse::<DocumentType>)
        .transpose()
        .map_err(bad_request)?;

    let mut event = UploadEvent::new(req.document_ref, document_type);
    if let Some(uploaded_at) = req.uploaded_at {
        event.uploaded_at = uploaded_at;
    }
    let submission = state.orchestrator.submit(&event, req.force).await?;

    if let Some(claim) = submission.claim.clone() {
        let orchestrator = state.orchestrator.clone();
        tokio::spawn(async move {
            if let Err(err) = orchestrator.process(&claim).await {
                warn!(document_id = %claim.document_id, error = %err, "background processing abandoned");
            }
        });
    }

    Ok((StatusCode::ACCEPTED, Json(submission)))
}

// ============ GET /documents/{ref}/status ============

async fn handle_status(
    State(state): State<AppState>,
    Path(document_ref): Path<String>,
) -> Result<Json<StatusReport>, AppError> {
    let report = state
        .orchestrator
        .status(&document_ref)
        .await?
        .ok_or_else(|| not_found(format!("no document with ref: {}", document_ref)))?;
    Ok(Json(report))
}
