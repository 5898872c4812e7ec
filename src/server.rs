//! Job control HTTP server (`ocrflow serve`).
//!
//! Accepts fetch, OCR and analysis submissions, runs each as a supervised
//! child process of this executable, and exposes job state, logs and
//! cancellation.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/api/defaults` | Model names offered to clients |
//! | `POST` | `/api/run-drive` | Submit a Drive download job |
//! | `POST` | `/api/run-ocr` | Submit an OCR job |
//! | `POST` | `/api/run-analysis` | Submit an analysis job |
//! | `GET`  | `/api/jobs` | All jobs, newest first |
//! | `GET`  | `/api/jobs/{id}` | One job snapshot |
//! | `POST` | `/api/jobs/{id}/cancel` | Cancel a running job |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Source directory not found: /data" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser frontend
//! served from elsewhere can drive the API.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::commands::{AnalysisPayload, DrivePayload, Launcher, OcrPayload};
use crate::config::Config;
use crate::jobs::{JobDetail, JobRegistry, JobStatus, JobType};

/// Pause between a cancel request and the returned snapshot, so the kill
/// usually shows up in it.
const CANCEL_SETTLE: Duration = Duration::from_millis(200);

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    jobs: Arc<JobRegistry>,
    launcher: Arc<Launcher>,
}

impl AppState {
    pub fn new(config: Config, launcher: Launcher) -> Self {
        Self {
            config: Arc::new(config),
            jobs: Arc::new(JobRegistry::new()),
            launcher: Arc::new(launcher),
        }
    }
}

/// All routes with CORS applied.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/defaults", get(handle_defaults))
        .route("/api/run-drive", post(handle_run_drive))
        .route("/api/run-ocr", post(handle_run_ocr))
        .route("/api/run-analysis", post(handle_run_analysis))
        .route("/api/jobs", get(handle_list_jobs))
        .route("/api/jobs/{id}", get(handle_get_job))
        .route("/api/jobs/{id}/cancel", post(handle_cancel_job))
        .layer(cors)
        .with_state(state)
}

/// Bind to `[server].bind` (or `bind_override`) and serve until the process is terminated.
///
/// Jobs re-invoke the current executable; `config_path` is forwarded to
/// them as `--config` so they see the same settings as the server.
pub async fn run_server(
    config: &Config,
    config_path: Option<PathBuf>,
    bind_override: Option<String>,
) -> anyhow::Result<()> {
    let bind_addr = bind_override.unwrap_or_else(|| config.server.bind.clone());
    let launcher = Launcher::current_exe(config_path)?;
    let app = router(AppState::new(config.clone(), launcher));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("job server listening on http://{}", bind_addr);
    println!("ocrflow server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
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

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
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

// ============ GET /api/defaults ============

#[derive(Serialize)]
struct DefaultsResponse {
    models: Vec<String>,
    model: String,
    region: String,
}

async fn handle_defaults(State(state): State<AppState>) -> Json<DefaultsResponse> {
    Json(DefaultsResponse {
        models: state.config.server.models.clone(),
        model: state.config.analysis.model.clone(),
        region: state.config.analysis.region.clone(),
    })
}

// ============ POST /api/run-* ============

/// Response body for a job submission.
#[derive(Serialize)]
struct JobResponse {
    job_id: String,
    status: JobStatus,
}

fn submit(
    state: &AppState,
    command: anyhow::Result<Vec<String>>,
    job_type: JobType,
) -> Result<Json<JobResponse>, AppError> {
    let command = command.map_err(|e| bad_request(format!("{:#}", e)))?;
    let job = state
        .jobs
        .submit(command, job_type)
        .map_err(|e| internal(format!("{:#}", e)))?;
    Ok(Json(JobResponse {
        job_id: job.id().to_string(),
        status: job.status(),
    }))
}

async fn handle_run_drive(
    State(state): State<AppState>,
    Json(payload): Json<DrivePayload>,
) -> Result<Json<JobResponse>, AppError> {
    let command = payload.command(&state.launcher);
    submit(&state, command, JobType::Drive)
}

async fn handle_run_ocr(
    State(state): State<AppState>,
    Json(payload): Json<OcrPayload>,
) -> Result<Json<JobResponse>, AppError> {
    let command = payload.command(&state.launcher);
    submit(&state, command, JobType::Ocr)
}

async fn handle_run_analysis(
    State(state): State<AppState>,
    Json(payload): Json<AnalysisPayload>,
) -> Result<Json<JobResponse>, AppError> {
    let command = payload.command(&state.launcher);
    submit(&state, command, JobType::Analysis)
}

// ============ /api/jobs ============

async fn handle_list_jobs(State(state): State<AppState>) -> Json<Vec<JobDetail>> {
    Json(state.jobs.list().iter().map(|job| job.snapshot()).collect())
}

async fn handle_get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobDetail>, AppError> {
    let job = state
        .jobs
        .get(&id)
        .ok_or_else(|| not_found(format!("job not found: {}", id)))?;
    Ok(Json(job.snapshot()))
}

async fn handle_cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobDetail>, AppError> {
    let job = state
        .jobs
        .get(&id)
        .ok_or_else(|| not_found(format!("job not found: {}", id)))?;
    job.cancel();
    tokio::time::sleep(CANCEL_SETTLE).await;
    Ok(Json(job.snapshot()))
}
