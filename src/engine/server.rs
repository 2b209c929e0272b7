// ── Moniteur Engine: HTTP Surface ──────────────────────────────────────────
// Thin axum router over the engine; handlers validate input, call one
// engine service, and translate `EngineError` into the error envelope
// `{error: {kind, message, retriable}}`. No business logic lives here.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::atoms::error::{EngineError, ErrorKind};
use crate::atoms::types::RetrievalFilters;
use crate::engine::state::EngineState;

// ── Error envelope ─────────────────────────────────────────────────────────

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Invalid | ErrorKind::Permanent => StatusCode::BAD_REQUEST,
            ErrorKind::Unavailable | ErrorKind::Timeout | ErrorKind::Transient => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        let body = Json(json!({
            "error": {
                "kind": kind.as_str(),
                "message": self.0.to_string(),
                "retriable": self.0.retriable(),
            }
        }));
        let mut response = (status, body).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("30"));
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Router ─────────────────────────────────────────────────────────────────

pub fn router(state: Arc<EngineState>) -> Router {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route("/metrics", get(metrics))
        .route("/api/v1/ingest", post(ingest))
        .route("/api/v1/ingest/:job_id", get(ingest_status))
        .route("/api/v1/reports/daily", get(daily_report))
        .route("/api/v1/decisions/:id/rollback", post(rollback))
        .route("/api/v1/rag/query", post(rag_query))
        .route("/api/v1/admin/reindex", post(admin_reindex))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the shutdown flag is set.
pub async fn serve(state: Arc<EngineState>) -> std::io::Result<()> {
    let addr = format!("{}:{}", state.config.server.bind, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("[server] Listening on http://{}", addr);
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !shutdown.load(std::sync::atomic::Ordering::Relaxed) {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        })
        .await
}

// ── Handlers ───────────────────────────────────────────────────────────────

async fn health_live() -> &'static str {
    // Reaching this handler means config loaded and the engine constructed.
    "ok"
}

async fn health_ready(State(state): State<Arc<EngineState>>) -> Response {
    if state.ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<EngineState>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
        .into_response()
}

#[derive(Deserialize)]
struct IngestRequest {
    source_uri: String,
}

async fn ingest(
    State(state): State<Arc<EngineState>>,
    Json(req): Json<IngestRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.source_uri.trim().is_empty() {
        return Err(EngineError::invalid("source_uri must not be empty").into());
    }
    let job_id = state.start_ingest(&req.source_uri)?;
    Ok(Json(json!({ "job_id": job_id })))
}

async fn ingest_status(
    State(state): State<Arc<EngineState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = state
        .ingestor
        .status(&job_id)
        .ok_or_else(|| EngineError::not_found(format!("job {}", job_id)))?;
    Ok(Json(serde_json::to_value(&status).map_err(EngineError::from)?))
}

#[derive(Deserialize)]
struct DailyReportQuery {
    user_id: String,
    date: String,
}

async fn daily_report(
    State(state): State<Arc<EngineState>>,
    Query(q): Query<DailyReportQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let report = state
        .store
        .get_report(&q.user_id, &q.date)?
        .ok_or_else(|| EngineError::not_found(format!("report for {} on {}", q.user_id, q.date)))?;
    Ok(Json(serde_json::to_value(&report).map_err(EngineError::from)?))
}

async fn rollback(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let decision = state.decisions.rollback(&id).await?;
    Ok(Json(serde_json::to_value(&decision).map_err(EngineError::from)?))
}

#[derive(Deserialize)]
struct RagQueryRequest {
    query: String,
    #[serde(default)]
    filters: RetrievalFilters,
    k: Option<usize>,
    /// When true, a grounded answer is generated over the hits.
    #[serde(default)]
    answer: bool,
}

async fn rag_query(
    State(state): State<Arc<EngineState>>,
    Json(req): Json<RagQueryRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.query.trim().is_empty() {
        return Err(EngineError::invalid("query must not be empty").into());
    }
    let hits = state.retrieval.retrieve(&req.query, &req.filters, req.k).await?;
    let answer = if req.answer {
        let scope = state.retrieval.fingerprint_for(&req.query, &req.filters, req.k)?;
        Some(state.reasoning.answer(&req.query, &hits, scope.as_deref()).await?)
    } else {
        None
    };
    Ok(Json(json!({ "hits": hits, "answer": answer })))
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ReindexRequest {
    Begin,
    Finalize { index_name: String },
    Abort { index_name: String },
}

async fn admin_reindex(
    State(state): State<Arc<EngineState>>,
    Json(req): Json<ReindexRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    match req {
        ReindexRequest::Begin => {
            let name = state.index.begin_reindex(&state.config.embedding.version)?;
            Ok(Json(json!({ "index_name": name, "state": "building" })))
        }
        ReindexRequest::Finalize { index_name } => {
            state.index.finalize(&index_name)?;
            Ok(Json(json!({ "index_name": index_name, "state": "ready" })))
        }
        ReindexRequest::Abort { index_name } => {
            state.index.abort(&index_name)?;
            Ok(Json(json!({ "index_name": index_name, "state": "aborted" })))
        }
    }
}
