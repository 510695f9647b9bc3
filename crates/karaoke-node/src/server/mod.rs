//! Local HTTP API for the front-end.
//!
//! Bound to loopback. Everything here answers from local state except
//! activation, discovery, downloads and history pushes.

mod error;

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;

use karaoke_core::catalog::CatalogCode;
use karaoke_core::wire::{ErrorBody, HealthResponse};

use crate::error::Result;
use crate::history::{HistoryRelay, PushReport};
use crate::license::{Lease, LicenseReconciler, RevalidationStatus};
use crate::player::{FinishOutcome, PlayerSession, PlayerState};
use crate::queue::{PlayQueue, QueueItem};
use crate::storage::{CatalogRow, OfflineStatus};
use crate::sync::{BatchReport, DiscoverReport, ReindexReport, SyncEngine};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub license: Arc<LicenseReconciler>,
    pub sync: Arc<SyncEngine>,
    pub history: Arc<HistoryRelay>,
    pub queue: Arc<PlayQueue>,
    pub player: Arc<PlayerSession>,
}

/// Build the local API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/lease", get(lease))
        .route("/activation", post(activate).delete(deactivate))
        .route("/offline-status", get(offline_status))
        .route("/sync/discover", post(discover))
        .route("/sync/batch", post(download_batch))
        .route("/sync/reindex", post(reindex))
        .route("/sync/pending", get(pending))
        .route("/queue", get(queue_list).post(queue_push).delete(queue_clear))
        .route("/queue/next", get(queue_next))
        .route("/queue/pop", post(queue_pop))
        .route("/player", get(player_state))
        .route("/player/start", post(player_start))
        .route("/player/finish", post(player_finish))
        .route("/history", post(record_play))
        .route("/history/push", post(push_history))
        .route("/catalog/search", get(search))
        .route("/catalog/random", get(random_entry))
        .route("/catalog/{code}", get(catalog_entry))
        .route("/media/{code}", get(media))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =========================================================================
// Request / response bodies
// =========================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseResponse {
    #[serde(flatten)]
    pub lease: Lease,
    pub last_revalidation: RevalidationStatus,
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemovedResponse {
    pub removed: bool,
}

#[derive(Debug, Deserialize)]
pub struct BatchQuery {
    pub n: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct QueuePushRequest {
    pub codigo: String,
    pub titulo: Option<String>,
    pub artista: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueLengthResponse {
    pub length: usize,
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    pub codigo: String,
}

#[derive(Debug, Deserialize)]
pub struct FinishRequest {
    #[serde(default = "default_completed")]
    pub completed: bool,
}

const fn default_completed() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordedResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

fn parse_code(raw: &str) -> Result<CatalogCode> {
    Ok(CatalogCode::parse(raw)?)
}

// =========================================================================
// Handlers
// =========================================================================

/// `GET /health`
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

/// `GET /lease`
async fn lease(State(state): State<AppState>) -> Json<LeaseResponse> {
    Json(LeaseResponse {
        lease: state.license.get_local_lease().await,
        last_revalidation: state.license.last_revalidation(),
    })
}

/// `POST /activation`
async fn activate(
    State(state): State<AppState>,
    Json(req): Json<ActivateRequest>,
) -> Result<Json<Lease>> {
    Ok(Json(state.license.validate_key(&req.key).await?))
}

/// `DELETE /activation`
async fn deactivate(State(state): State<AppState>) -> Result<Json<RemovedResponse>> {
    let removed = state.license.remove_activation().await?;
    Ok(Json(RemovedResponse { removed }))
}

/// `GET /offline-status`
async fn offline_status(State(state): State<AppState>) -> Result<Json<OfflineStatus>> {
    Ok(Json(state.sync.offline_status().await?))
}

/// `POST /sync/discover`
async fn discover(State(state): State<AppState>) -> Result<Json<DiscoverReport>> {
    Ok(Json(state.sync.discover().await?))
}

/// `POST /sync/batch?n=`
async fn download_batch(
    State(state): State<AppState>,
    Query(query): Query<BatchQuery>,
) -> Result<Json<BatchReport>> {
    let n = query.n.unwrap_or(state.sync.config().batch_size).max(1);
    Ok(Json(state.sync.download_batch(n).await?))
}

/// `POST /sync/reindex`
async fn reindex(State(state): State<AppState>) -> Result<Json<ReindexReport>> {
    Ok(Json(state.sync.reindex().await?))
}

/// `GET /sync/pending`
async fn pending(State(state): State<AppState>) -> Result<Json<Vec<CatalogRow>>> {
    Ok(Json(state.sync.list_pending().await?))
}

/// `GET /queue`
async fn queue_list(State(state): State<AppState>) -> Json<Vec<QueueItem>> {
    Json(state.queue.snapshot())
}

/// `POST /queue`
///
/// Missing title or artist is filled from the local catalog when the code is
/// mirrored.
async fn queue_push(
    State(state): State<AppState>,
    Json(req): Json<QueuePushRequest>,
) -> Result<Json<QueueLengthResponse>> {
    let codigo = parse_code(&req.codigo)?;
    let mut item = QueueItem {
        codigo,
        titulo: req.titulo,
        artista: req.artista,
    };
    if (item.titulo.is_none() || item.artista.is_none())
        && let Some(row) = state.sync.lookup(&item.codigo).await?
    {
        item.titulo.get_or_insert(row.titulo);
        item.artista.get_or_insert(row.artista);
    }
    let length = state.queue.push(item);
    Ok(Json(QueueLengthResponse { length }))
}

/// `DELETE /queue`
async fn queue_clear(State(state): State<AppState>) -> StatusCode {
    state.queue.clear();
    StatusCode::NO_CONTENT
}

/// `GET /queue/next`
async fn queue_next(State(state): State<AppState>) -> Json<Option<QueueItem>> {
    Json(state.queue.next())
}

/// `POST /queue/pop`
async fn queue_pop(State(state): State<AppState>) -> Json<Option<QueueItem>> {
    Json(state.queue.pop())
}

/// `GET /player`
async fn player_state(State(state): State<AppState>) -> Json<PlayerState> {
    Json(state.player.state().await)
}

/// `POST /player/start`
async fn player_start(
    State(state): State<AppState>,
    Json(req): Json<CodeRequest>,
) -> Result<Json<PlayerState>> {
    let codigo = parse_code(&req.codigo)?;
    Ok(Json(state.player.start(codigo).await))
}

/// `POST /player/finish`
async fn player_finish(
    State(state): State<AppState>,
    Json(req): Json<FinishRequest>,
) -> Json<FinishOutcome> {
    Json(state.player.finish(req.completed).await)
}

/// `POST /history`
async fn record_play(
    State(state): State<AppState>,
    Json(req): Json<CodeRequest>,
) -> Result<Json<RecordedResponse>> {
    let codigo = parse_code(&req.codigo)?;
    let id = state.history.record_play(&codigo).await?;
    Ok(Json(RecordedResponse { id }))
}

/// `POST /history/push`
async fn push_history(State(state): State<AppState>) -> Result<Json<PushReport>> {
    Ok(Json(state.history.push_unsynced().await?))
}

/// `GET /catalog/search?q=`
async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<CatalogRow>>> {
    Ok(Json(state.sync.search(&query.q).await?))
}

/// `GET /catalog/{code}`
async fn catalog_entry(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Response> {
    let code = parse_code(&code)?;
    Ok(match state.sync.lookup(&code).await? {
        Some(row) => Json(row).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody::new(
                "unknown_code",
                format!("catalog code {code} is not in the local catalog"),
            )),
        )
            .into_response(),
    })
}

/// `GET /catalog/random`
///
/// A random song that can play offline, or `null` with nothing downloaded.
async fn random_entry(State(state): State<AppState>) -> Result<Json<Option<CatalogRow>>> {
    Ok(Json(state.sync.random_local().await?))
}

/// `GET /media/{code}`
///
/// Streams a downloaded file. Range requests get partial content so the
/// player can seek.
async fn media(
    State(state): State<AppState>,
    Path(code): Path<String>,
    request: Request,
) -> Result<Response> {
    let code = parse_code(&code)?;
    let Some(path) = state.sync.local_media(&code).await? else {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(ErrorBody::new(
                "not_downloaded",
                format!("media for {code} is not on this device"),
            )),
        )
            .into_response());
    };
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => Ok(response.into_response()),
        Err(never) => match never {},
    }
}
