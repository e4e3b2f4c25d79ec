//! HTTP API over the [`ResearchEngine`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/research` | Start a task, returns `{ "task_id" }` (202) |
//! | `GET`  | `/research` | List live tasks, newest first |
//! | `GET`  | `/research/{id}` | Task status snapshot |
//! | `GET`  | `/research/{id}/result` | Final report (409 until completed) |
//! | `POST` | `/research/{id}/cancel` | Request cancellation (202) |
//! | `POST` | `/context` | Ranked context chunks for a repository |
//! | `GET`  | `/providers` | Providers with capabilities and availability |
//! | `POST` | `/providers/default` | Move a provider to the front for a kind |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "not found: task 42" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `not_ready` (409),
//! `providers_unavailable` (503), `retrieval_unavailable` (503),
//! `internal` (500).

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use research_harness_core::models::{Report, RetrievalResult, TaskOptions};
use research_harness_core::task::TaskStatus;

use crate::engine::ResearchEngine;
use crate::error::ResearchError;
use crate::providers::ProviderInfo;
use crate::retriever::RetrievalOptions;

/// Bind `[server].bind` and serve until the process exits.
pub async fn run_server(engine: Arc<ResearchEngine>) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "research server listening");
    let _sweeper = engine.spawn_cache_sweeper();
    serve(listener, engine).await
}

/// Serve on an already-bound listener.
pub async fn serve(listener: TcpListener, engine: Arc<ResearchEngine>) -> anyhow::Result<()> {
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

pub fn router(engine: Arc<ResearchEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/research", post(handle_start).get(handle_list))
        .route("/research/{id}", get(handle_status))
        .route("/research/{id}/result", get(handle_result))
        .route("/research/{id}/cancel", post(handle_cancel))
        .route("/context", post(handle_context))
        .route("/providers", get(handle_providers))
        .route("/providers/default", post(handle_switch_provider))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(engine)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
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
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ResearchError> for AppError {
    fn from(err: ResearchError) -> Self {
        let (status, code) = match &err {
            ResearchError::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ResearchError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ResearchError::NotReady { .. } => (StatusCode::CONFLICT, "not_ready"),
            ResearchError::AllProvidersUnavailable(_) | ResearchError::TransientProvider { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "providers_unavailable")
            }
            ResearchError::RetrievalUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "retrieval_unavailable")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            tracing::warn!(error = %err, "request failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, AppError>;

// ============ /research ============

#[derive(Deserialize)]
struct StartRequest {
    query: String,
    #[serde(flatten)]
    options: TaskOptions,
}

#[derive(Serialize)]
struct StartResponse {
    task_id: String,
}

async fn handle_start(
    State(engine): State<Arc<ResearchEngine>>,
    Json(req): Json<StartRequest>,
) -> ApiResult<(StatusCode, Json<StartResponse>)> {
    let task_id = engine.start_task(&req.query, req.options).await?;
    Ok((StatusCode::ACCEPTED, Json(StartResponse { task_id })))
}

#[derive(Serialize)]
struct TaskListResponse {
    tasks: Vec<TaskStatus>,
}

async fn handle_list(State(engine): State<Arc<ResearchEngine>>) -> Json<TaskListResponse> {
    Json(TaskListResponse {
        tasks: engine.list_tasks(),
    })
}

async fn handle_status(
    State(engine): State<Arc<ResearchEngine>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskStatus>> {
    Ok(Json(engine.get_status(&id).await?))
}

async fn handle_result(
    State(engine): State<Arc<ResearchEngine>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Report>> {
    Ok(Json(engine.get_result(&id).await?))
}

async fn handle_cancel(
    State(engine): State<Arc<ResearchEngine>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    engine.cancel_task(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

// ============ /context ============

#[derive(Deserialize)]
struct ContextRequest {
    query: String,
    repository_id: String,
    #[serde(default)]
    k: Option<usize>,
    #[serde(flatten)]
    options: RetrievalOptions,
}

async fn handle_context(
    State(engine): State<Arc<ResearchEngine>>,
    Json(req): Json<ContextRequest>,
) -> ApiResult<Json<RetrievalResult>> {
    Ok(Json(
        engine
            .get_context(&req.query, &req.repository_id, req.k, req.options)
            .await?,
    ))
}

// ============ /providers ============

#[derive(Serialize)]
struct ProviderListResponse {
    providers: Vec<ProviderInfo>,
}

async fn handle_providers(State(engine): State<Arc<ResearchEngine>>) -> Json<ProviderListResponse> {
    Json(ProviderListResponse {
        providers: engine.list_providers().await,
    })
}

#[derive(Deserialize)]
struct SwitchRequest {
    kind: String,
    name: String,
}

async fn handle_switch_provider(
    State(engine): State<Arc<ResearchEngine>>,
    Json(req): Json<SwitchRequest>,
) -> ApiResult<StatusCode> {
    engine.switch_provider(&req.kind, &req.name)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
