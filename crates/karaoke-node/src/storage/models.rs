//! Database models for the karaoke node.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use karaoke_core::catalog::{CatalogCode, media_extension};
use karaoke_core::license::{LeaseGrant, LicenseKey};
use karaoke_core::wire::HistoryRecord;

use super::DatabaseError;

/// The single lease row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaseRow {
    pub key: String,
    pub kind: String,
    pub activated_at: Option<i64>,
    pub time_budget_days: Option<i64>,
    pub expires_at: Option<i64>,
    /// Remaining days as reported at `last_validated_at`.
    pub dias_restantes: Option<i64>,
    /// Remaining hours as reported at `last_validated_at` (machine keys).
    pub horas_restantes: Option<f64>,
    pub revoked: bool,
    pub last_validated_at: i64,
}

impl LeaseRow {
    /// Build the row persisted after a successful validation.
    pub fn from_grant(grant: &LeaseGrant) -> Self {
        Self {
            key: grant.key.to_string(),
            kind: grant.kind.as_str().to_string(),
            activated_at: grant.activated_at,
            time_budget_days: grant.time_budget_days,
            expires_at: grant.expires_at,
            dias_restantes: grant.remaining.dias_restantes,
            horas_restantes: grant.remaining.horas_restantes,
            revoked: false,
            last_validated_at: grant.validated_at,
        }
    }

    pub fn license_key(&self) -> Result<LicenseKey, DatabaseError> {
        LicenseKey::parse(&self.key)
            .map_err(|e| DatabaseError::Corrupt(format!("lease key: {e}")))
    }
}

/// Catalog mirror row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CatalogRow {
    pub codigo: String,
    pub remote_revision: Option<i64>,
    pub artista: String,
    pub titulo: String,
    pub media_ref: String,
    pub size: Option<i64>,
    pub duration: Option<i64>,
    /// `None` until the media is on disk.
    pub local_path: Option<String>,
    pub discovered_at: i64,
    pub synced_at: Option<i64>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub orphaned_at: Option<i64>,
}

impl CatalogRow {
    pub fn code(&self) -> Result<CatalogCode, DatabaseError> {
        CatalogCode::parse(&self.codigo)
            .map_err(|e| DatabaseError::Corrupt(format!("catalog row: {e}")))
    }

    /// File name the media is stored under.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.codigo, media_extension(&self.media_ref))
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        self.local_path.as_ref().map(PathBuf::from)
    }
}

/// Play history row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct HistoryRow {
    pub id: String,
    pub codigo: String,
    pub played_at: i64,
    pub synced_at: Option<i64>,
}

impl HistoryRow {
    pub fn to_record(&self) -> Result<HistoryRecord, DatabaseError> {
        Ok(HistoryRecord {
            id: self.id.clone(),
            codigo: CatalogCode::parse(&self.codigo)
                .map_err(|e| DatabaseError::Corrupt(format!("history row {}: {e}", self.id)))?,
            played_at: self.played_at,
        })
    }
}
