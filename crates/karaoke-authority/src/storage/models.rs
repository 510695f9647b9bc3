//! Database models for the karaoke authority.

use serde::{Deserialize, Serialize};

use karaoke_core::catalog::{CatalogCode, CatalogEntry};
use karaoke_core::license::{ActivationKey, KeyKind, KeyStatus, LicenseKey};

use super::DatabaseError;

/// Activation key record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivationKeyRow {
    pub key: String,
    pub kind: String,
    pub status: String,
    pub bound_device_id: Option<String>,
    pub activated_at: Option<i64>,
    pub last_used_at: Option<i64>,
    pub time_budget_days: Option<i64>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

impl ActivationKeyRow {
    /// Convert to the domain record, rejecting rows that do not parse.
    pub fn to_domain(&self) -> Result<ActivationKey, DatabaseError> {
        let corrupt = |what: String| DatabaseError::Corrupt(format!("key {}: {what}", self.key));
        Ok(ActivationKey {
            key: LicenseKey::parse(&self.key).map_err(|e| corrupt(e.to_string()))?,
            kind: self.kind.parse::<KeyKind>().map_err(corrupt)?,
            status: self.status.parse::<KeyStatus>().map_err(corrupt)?,
            bound_device_id: self.bound_device_id.clone(),
            activated_at: self.activated_at,
            last_used_at: self.last_used_at,
            time_budget_days: self.time_budget_days,
            expires_at: self.expires_at,
        })
    }
}

/// Catalog record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CatalogRow {
    pub id: i64,
    pub codigo: String,
    pub artista: String,
    pub titulo: String,
    pub media_ref: String,
    pub size: Option<i64>,
    pub duration: Option<i64>,
    pub placeholder: bool,
    pub revision: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CatalogRow {
    pub fn to_entry(&self) -> Result<CatalogEntry, DatabaseError> {
        Ok(CatalogEntry {
            revision: self.revision,
            codigo: CatalogCode::parse(&self.codigo)
                .map_err(|e| DatabaseError::Corrupt(e.to_string()))?,
            artista: self.artista.clone(),
            titulo: self.titulo.clone(),
            media_ref: self.media_ref.clone(),
            size: self.size,
            duration: self.duration,
        })
    }
}

/// Metadata for publishing a song.
#[derive(Debug, Clone)]
pub struct NewCatalogEntry<'a> {
    pub codigo: &'a CatalogCode,
    pub artista: &'a str,
    pub titulo: &'a str,
    pub media_ref: &'a str,
    pub size: Option<i64>,
    pub duration: Option<i64>,
}

/// Outcome of storing one pushed history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryInsert {
    Inserted,
    /// Same id already stored; counts as accepted.
    Duplicate,
    UnknownCode,
}
