//! JSON bodies exchanged between a node and the authority.

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogCode, CatalogEntry};
use crate::license::{LicenseKey, ValidationError};

/// Default catalog page size.
pub const DEFAULT_PAGE_LIMIT: u32 = 100;
/// Largest page the authority hands out.
pub const MAX_PAGE_LIMIT: u32 = 500;
/// Largest history batch accepted in one push.
pub const MAX_HISTORY_BATCH: usize = 100;

/// `POST /v1/activation/validate`
///
/// The key is sent as typed so the authority reports format errors too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub key: String,
    pub device_id: String,
}

/// Error body returned by every authority endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable snake_case code (`not_found`, `machine_conflict`, ...).
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn validation(err: ValidationError) -> Self {
        Self::new(err.code(), err.to_string())
    }

    /// The validation failure this body carries, if it is one.
    pub fn as_validation(&self) -> Option<ValidationError> {
        serde_json::from_value(serde_json::Value::String(self.error.clone())).ok()
    }
}

/// `GET /v1/catalog?since=&limit=`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogQuery {
    #[serde(default)]
    pub since: i64,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

const fn default_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

impl Default for CatalogQuery {
    fn default() -> Self {
        Self {
            since: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// One page of catalog entries ordered by revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogPage {
    pub entries: Vec<CatalogEntry>,
    /// Cursor to pass as `since` for the next page.
    pub next_cursor: i64,
    pub has_more: bool,
}

/// A play recorded on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    pub codigo: CatalogCode,
    pub played_at: i64,
}

/// `POST /v1/history`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushHistoryRequest {
    pub key: LicenseKey,
    pub device_id: String,
    pub entries: Vec<HistoryRecord>,
}

/// Why the authority refused a single history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The code is not in the authority catalog.
    UnknownCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub id: String,
    pub reason: RejectReason,
}

/// Per-record outcome of a history push. Duplicates count as accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushHistoryResponse {
    pub accepted: Vec<String>,
    pub rejected: Vec<RejectedRecord>,
}

/// `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
