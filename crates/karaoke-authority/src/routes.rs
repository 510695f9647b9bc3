//! HTTP API served to nodes.

use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use karaoke_core::catalog::{CatalogCode, CatalogEntry};
use karaoke_core::clock::SharedClock;
use karaoke_core::license::{LeaseGrant, ValidationError};
use karaoke_core::wire::{
    CatalogPage, CatalogQuery, ErrorBody, HealthResponse, MAX_HISTORY_BATCH, MAX_PAGE_LIMIT,
    PushHistoryRequest, PushHistoryResponse, RejectReason, RejectedRecord, ValidateRequest,
};

use crate::storage::{AuthorityDatabase, DatabaseError, HistoryInsert};
use crate::validation::{ValidateError, validate_key};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: AuthorityDatabase,
    pub clock: SharedClock,
    /// Directory served under `/media`.
    pub media_dir: PathBuf,
}

/// Build the authority router.
pub fn build_router(state: AppState) -> Router {
    let media = ServeDir::new(&state.media_dir);
    Router::new()
        .route("/health", get(health))
        .route("/v1/activation/validate", post(validate))
        .route("/v1/catalog", get(catalog_page))
        .route("/v1/catalog/{code}", get(catalog_entry))
        .route("/v1/catalog/{code}/placeholder", put(placeholder))
        .route("/v1/history", post(push_history))
        .nest_service("/media", media)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error responses. Every variant renders as an [`ErrorBody`].
#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    BadRequest(String),
    UnknownCode(String),
    Internal(DatabaseError),
}

impl From<ValidateError> for ApiError {
    fn from(e: ValidateError) -> Self {
        match e {
            ValidateError::Rejected(v) => Self::Validation(v),
            ValidateError::Database(d) => Self::Internal(d),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        Self::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Validation(e) => (
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::BAD_REQUEST),
                ErrorBody::validation(e),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorBody::new("bad_request", msg)),
            Self::UnknownCode(code) => (
                StatusCode::NOT_FOUND,
                ErrorBody::new("unknown_code", format!("catalog code {code} is not published")),
            ),
            Self::Internal(e) => {
                error!(error = %e, "Storage failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody::new("internal", "internal storage error"),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn parse_code(raw: &str) -> Result<CatalogCode, ApiError> {
    CatalogCode::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// `GET /health`
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

/// `POST /v1/activation/validate`
async fn validate(
    State(state): State<AppState>,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<LeaseGrant>, ApiError> {
    let grant = validate_key(&state.db, &req.key, &req.device_id, state.clock.now()).await?;
    Ok(Json(grant))
}

/// `GET /v1/catalog?since=&limit=`
async fn catalog_page(
    State(state): State<AppState>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<CatalogPage>, ApiError> {
    let limit = query.limit.clamp(1, MAX_PAGE_LIMIT);
    let rows = state.db.catalog_page(query.since, limit).await?;
    let entries = rows
        .iter()
        .map(crate::storage::CatalogRow::to_entry)
        .collect::<Result<Vec<_>, _>>()?;
    let next_cursor = entries.last().map_or(query.since, |e| e.revision);
    let has_more = entries.len() == limit as usize;
    Ok(Json(CatalogPage {
        entries,
        next_cursor,
        has_more,
    }))
}

/// `GET /v1/catalog/{code}`
async fn catalog_entry(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<CatalogEntry>, ApiError> {
    let code = parse_code(&code)?;
    let row = state
        .db
        .get_catalog_entry(&code)
        .await?
        .ok_or_else(|| ApiError::UnknownCode(code.to_string()))?;
    Ok(Json(row.to_entry()?))
}

/// `PUT /v1/catalog/{code}/placeholder`
async fn placeholder(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<StatusCode, ApiError> {
    let code = parse_code(&code)?;
    let row = state.db.upsert_placeholder(&code).await?;
    if row.placeholder {
        info!(codigo = %code, "Placeholder catalog entry ensured");
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/history`
async fn push_history(
    State(state): State<AppState>,
    Json(req): Json<PushHistoryRequest>,
) -> Result<Json<PushHistoryResponse>, ApiError> {
    if req.entries.len() > MAX_HISTORY_BATCH {
        return Err(ApiError::BadRequest(format!(
            "at most {MAX_HISTORY_BATCH} history entries per push"
        )));
    }
    if state.db.get_key(req.key.as_str()).await?.is_none() {
        return Err(ApiError::Validation(ValidationError::NotFound));
    }

    let mut response = PushHistoryResponse::default();
    for record in &req.entries {
        match state.db.insert_history(record, &req.key, &req.device_id).await? {
            HistoryInsert::Inserted | HistoryInsert::Duplicate => {
                response.accepted.push(record.id.clone());
            }
            HistoryInsert::UnknownCode => response.rejected.push(RejectedRecord {
                id: record.id.clone(),
                reason: RejectReason::UnknownCode,
            }),
        }
    }

    info!(
        key = %req.key.redacted(),
        accepted = response.accepted.len(),
        rejected = response.rejected.len(),
        "History pushed"
    );
    Ok(Json(response))
}
