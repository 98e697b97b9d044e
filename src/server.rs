//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/query` | Answer a question: `{question, retrieval_mode?}` |
//! | `POST` | `/ingest` | Start a background ingestion of every source |
//! | `GET`  | `/healthz` | API and index health (503 when the index is down) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `conflict` (409), `generation_failed` (502),
//! `retrieval_unavailable` (503), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::engine::{Answer, Engine};
use crate::error::{EngineError, RetrievalError};
use crate::models::RetrievalMode;

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    /// Set while a background ingestion is running.
    ingesting: Arc<AtomicBool>,
}

/// Build the router over an existing engine.
pub fn router(engine: Arc<Engine>) -> Router {
    let state = AppState {
        engine,
        ingesting: Arc::new(AtomicBool::new(false)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", post(handle_query))
        .route("/ingest", post(handle_ingest))
        .route("/healthz", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `[server].bind` until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::from_config(config).await?);
    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("Listening on http://{}", config.server.bind);
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

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        let (status, code) = match &err {
            EngineError::Retrieval(RetrievalError::EmptyQuestion) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            EngineError::Retrieval(RetrievalError::AllModalitiesFailed(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "retrieval_unavailable")
            }
            EngineError::Retrieval(RetrievalError::Index(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
            EngineError::Generation(_) => (StatusCode::BAD_GATEWAY, "generation_failed"),
        };
        AppError {
            status,
            code,
            message,
        }
    }
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    question: String,
    #[serde(default)]
    retrieval_mode: Option<String>,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<Answer>, AppError> {
    let mode = match req.retrieval_mode.as_deref() {
        Some(raw) => raw.parse::<RetrievalMode>().map_err(bad_request)?,
        None => state.engine.default_mode(),
    };

    let answer = state.engine.ask(&req.question, mode).await?;
    Ok(Json(answer))
}

// ============ POST /ingest ============

#[derive(Serialize)]
struct IngestAccepted {
    status: &'static str,
}

/// Clears the running flag when the background task ends, including by panic.
struct IngestGuard(Arc<AtomicBool>);

impl Drop for IngestGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn handle_ingest(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    if state.ingesting.swap(true, Ordering::SeqCst) {
        return Err(AppError {
            status: StatusCode::CONFLICT,
            code: "conflict",
            message: "ingestion already running".to_string(),
        });
    }

    let engine = state.engine.clone();
    let guard = IngestGuard(state.ingesting.clone());
    tokio::spawn(async move {
        let _guard = guard;
        let report = engine.ingest_all().await;
        info!(
            documents = report.documents.len(),
            failures = report.failures.len(),
            chunks_written = report.chunks_written(),
            "Background ingestion finished"
        );
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestAccepted { status: "accepted" }),
    ))
}

// ============ GET /healthz ============

#[derive(Serialize)]
struct HealthResponse {
    api_status: &'static str,
    index_status: &'static str,
    version: &'static str,
}

async fn handle_health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match state.engine.index().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                api_status: "ok",
                index_status: "ok",
                version: env!("CARGO_PKG_VERSION"),
            }),
        ),
        Err(e) => {
            error!(error = %e, "Index health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    api_status: "ok",
                    index_status: "unreachable",
                    version: env!("CARGO_PKG_VERSION"),
                }),
            )
        }
    }
}
