//! Thin HTTP surface over the exposed operations.
//!
//! Five contract operations (add_sources, process_queue, search, status,
//! refresh_once) plus operator maintenance (clear-queue, reset). Interactive
//! tooling lives outside this crate; anything that can drive these routes
//! can drive the engine.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::core::error::is_corruption;
use crate::core::types::{
    CatalogEntry, EntryStatus, InsertOutcome, ProcessReport, RefreshReport, SearchHit,
    SearchOptions, StatusReport,
};
use crate::core::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sources", post(add_sources))
        .route("/process", post(process_queue))
        .route("/search", post(search))
        .route("/status", get(status))
        .route("/refresh", post(refresh_once))
        .route("/maintenance/clear-queue", post(clear_queue))
        .route("/maintenance/reset", post(reset))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

/// Store corruption is fatal by policy: log and exit rather than serve
/// inconsistent answers. Everything else is a plain 500.
fn internal_error(e: anyhow::Error) -> ApiError {
    if is_corruption(&e) {
        tracing::error!("store corruption detected: {:#}", e);
        std::process::exit(70);
    }
    tracing::error!("request failed: {:#}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: format!("{e:#}"),
        }),
    )
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct AddSourcesRequest {
    input: String,
}

async fn add_sources(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddSourcesRequest>,
) -> Result<Json<InsertOutcome>, ApiError> {
    let discovery = state.orchestrator.discover(&req.input).await;
    for warning in &discovery.warnings {
        tracing::warn!("discovery: {}", warning);
    }
    let entries: Vec<CatalogEntry> = discovery
        .candidates
        .into_iter()
        .map(|c| CatalogEntry::new(c.url, c.kind, c.priority, c.discovered_from))
        .collect();
    let outcome = state
        .catalog
        .insert_if_absent(entries)
        .await
        .map_err(internal_error)?;
    Ok(Json(outcome))
}

#[derive(Deserialize, Default)]
struct ProcessRequest {
    #[serde(default)]
    max_batches: Option<usize>,
}

async fn process_queue(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ProcessRequest>>,
) -> Result<Json<ProcessReport>, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let report = state
        .processor
        .process_queue(req.max_batches)
        .await
        .map_err(internal_error)?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(flatten)]
    options: SearchOptions,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
    warnings: Vec<String>,
}

async fn search(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let outcome = state
        .retrieval
        .search(&req.query, &req.options)
        .await
        .map_err(internal_error)?;
    Ok(Json(SearchResponse {
        results: outcome.hits,
        warnings: outcome.warnings,
    }))
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Json<StatusReport>, ApiError> {
    let (catalog_by_status, catalog_by_kind) =
        state.catalog.counts().await.map_err(internal_error)?;
    let chunk_count = state.vectors.count().await.map_err(internal_error)?;
    let api_quota = state.catalog.api_quota().await.map_err(internal_error)?;
    Ok(Json(StatusReport {
        catalog_by_status,
        catalog_by_kind,
        chunk_count,
        api_quota,
    }))
}

async fn refresh_once(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RefreshReport>, ApiError> {
    let report = state.refresher.refresh_once().await.map_err(internal_error)?;
    Ok(Json(report))
}

#[derive(Serialize)]
struct ClearQueueResponse {
    deleted: usize,
}

/// Deletes pending and failed rows only; fetched rows and their chunks are
/// untouchable outside a full reset.
async fn clear_queue(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ClearQueueResponse>, ApiError> {
    let deleted = state
        .catalog
        .clear(vec![EntryStatus::Pending, EntryStatus::Failed])
        .await
        .map_err(internal_error)?;
    Ok(Json(ClearQueueResponse { deleted }))
}

async fn reset(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    state.reset_all().await.map_err(internal_error)?;
    Ok(Json(serde_json::json!({ "status": "reset" })))
}
