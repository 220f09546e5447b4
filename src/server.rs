//! HTTP surface of the service.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Greeting |
//! | `GET`  | `/health` | Health check (version and run state) |
//! | `POST` | `/delta` | Delta notifications; buffered, answered `202` immediately |
//! | `POST` | `/remove-signatures` | Sanitize one piece on behalf of the calling session |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "piece must be an absolute IRI" } }
//! ```
//!
//! Error codes: `bad_request` (400), `pipeline_error` (500), `internal` (500).

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::coordinator::RunCoordinator;
use crate::delta::DeltaBuffer;
use crate::graph::Scope;
use crate::models::Changeset;
use crate::pipeline::{PipelineError, SignatureRemover};
use crate::sparql;

/// Delta bodies for large imports can be big.
const DELTA_BODY_LIMIT: usize = 500 * 1024 * 1024;

/// Builds the remover used for one direct request, scoped to its session.
pub type RemoverFactory =
    Arc<dyn Fn(Scope) -> anyhow::Result<SignatureRemover> + Send + Sync>;

/// Shared state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Notifications waiting for the next run.
    buffer: Arc<DeltaBuffer>,
    /// Drains `buffer` into runs, one at a time.
    coordinator: Arc<RunCoordinator>,
    /// Remover for `/remove-signatures`, built per request.
    direct: RemoverFactory,
    /// Log every notification body on arrival.
    log_incoming_deltas: bool,
}

impl AppState {
    pub fn new(
        buffer: Arc<DeltaBuffer>,
        coordinator: Arc<RunCoordinator>,
        direct: RemoverFactory,
        log_incoming_deltas: bool,
    ) -> Self {
        Self {
            buffer,
            coordinator,
            direct,
            log_incoming_deltas,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route(
            "/delta",
            post(handle_delta).layer(DefaultBodyLimit::max(DELTA_BODY_LIMIT)),
        )
        .route("/remove-signatures", post(handle_remove_signatures))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire the production services from `config` and serve until Ctrl-C.
///
/// Delta-driven work runs with sudo rights on the kanselarij graph; direct
/// requests act as the caller on the application graph.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let remover =
        SignatureRemover::from_config(config, Scope::Sudo, &config.graph.kanselarij_graph)?;
    let buffer = Arc::new(DeltaBuffer::new());
    let coordinator = RunCoordinator::new(
        Arc::clone(&buffer),
        Arc::new(remover),
        config.pipeline.recheck_delay(),
    );

    let direct_config = Arc::new(config.clone());
    let direct: RemoverFactory = Arc::new(move |scope| {
        SignatureRemover::from_config(
            &direct_config,
            scope,
            &direct_config.graph.application_graph,
        )
    });

    let state = AppState::new(
        buffer,
        coordinator,
        direct,
        config.pipeline.log_incoming_deltas,
    );

    let bind_addr = &config.server.bind;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!(%bind_addr, "pdf-signature-remover listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
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

fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: format!("{:#}", err),
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "pipeline_error".to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET / and GET /health ============

async fn handle_root() -> &'static str {
    "pdf-signature-remover is running\n"
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    run_state: String,
    buffered_changesets: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        run_state: state.coordinator.state().to_string(),
        buffered_changesets: state.buffer.len(),
    })
}

// ============ POST /delta ============

/// Buffers the notification and returns before any processing happens.
async fn handle_delta(
    State(state): State<AppState>,
    Json(changesets): Json<Vec<Changeset>>,
) -> StatusCode {
    if state.log_incoming_deltas {
        info!(
            body = %serde_json::to_string(&changesets).unwrap_or_default(),
            "received delta"
        );
    }
    state.buffer.push(changesets);
    state.coordinator.trigger();
    StatusCode::ACCEPTED
}

// ============ POST /remove-signatures ============

#[derive(Deserialize)]
struct RemoveRequest {
    piece: String,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

async fn handle_remove_signatures(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RemoveRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let piece = request.piece.trim();
    if !piece.contains(':') || sparql::escape_iri(piece).is_err() {
        return Err(bad_request(format!(
            "piece must be an absolute IRI, got '{}'",
            request.piece
        )));
    }
    let session_id = header(&headers, "mu-session-id")
        .ok_or_else(|| bad_request("mu-session-id header is required"))?;
    let scope = Scope::Session {
        session_id: session_id.to_string(),
        call_id: header(&headers, "mu-call-id").map(str::to_string),
    };

    let remover = (state.direct)(scope).map_err(internal)?;
    let outcome = remover.remove_signatures(piece).await?;
    info!(%piece, ?outcome, "direct request handled");
    Ok(Json(serde_json::json!({ "result": outcome })))
}
