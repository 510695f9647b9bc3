//! Catalog mirror queries.

use serde::{Deserialize, Serialize};

use karaoke_core::catalog::{CatalogCode, CatalogEntry};

use super::db::{DatabaseError, LocalStore};
use super::models::CatalogRow;

/// Counts over the local mirror.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStatus {
    pub total_catalog: i64,
    pub total_local: i64,
    pub total_pending_remote: i64,
    pub bytes_used: i64,
}

impl LocalStore {
    // =========================================================================
    // Catalog writes
    // =========================================================================

    /// Upsert remote metadata. Never touches the local path; clears any
    /// orphan mark since the authority knows the code again.
    pub async fn upsert_remote_entry(
        &self,
        entry: &CatalogEntry,
        now: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO catalog
                (codigo, remote_revision, artista, titulo, media_ref, size, duration, discovered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(codigo) DO UPDATE SET
                remote_revision = excluded.remote_revision,
                artista = excluded.artista,
                titulo = excluded.titulo,
                media_ref = excluded.media_ref,
                size = excluded.size,
                duration = excluded.duration,
                orphaned_at = NULL
            ",
        )
        .bind(entry.codigo.as_str())
        .bind(entry.revision)
        .bind(&entry.artista)
        .bind(&entry.titulo)
        .bind(&entry.media_ref)
        .bind(entry.size)
        .bind(entry.duration)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Upsert remote metadata together with a file already on disk.
    pub async fn upsert_local_entry(
        &self,
        entry: &CatalogEntry,
        local_path: &str,
        size: i64,
        now: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO catalog
                (codigo, remote_revision, artista, titulo, media_ref, size, duration,
                 local_path, discovered_at, synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(codigo) DO UPDATE SET
                remote_revision = excluded.remote_revision,
                artista = excluded.artista,
                titulo = excluded.titulo,
                media_ref = excluded.media_ref,
                size = excluded.size,
                duration = excluded.duration,
                local_path = excluded.local_path,
                synced_at = excluded.synced_at,
                last_error = NULL,
                orphaned_at = NULL
            ",
        )
        .bind(entry.codigo.as_str())
        .bind(entry.revision)
        .bind(&entry.artista)
        .bind(&entry.titulo)
        .bind(&entry.media_ref)
        .bind(size)
        .bind(entry.duration)
        .bind(local_path)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Record a finished download for an existing row.
    pub async fn mark_synced(
        &self,
        codigo: &str,
        local_path: &str,
        size: i64,
        now: i64,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE catalog
            SET local_path = ?, size = ?, synced_at = ?, last_error = NULL
            WHERE codigo = ?
            ",
        )
        .bind(local_path)
        .bind(size)
        .bind(now)
        .bind(codigo)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Catalog entry {codigo}")));
        }
        Ok(())
    }

    /// Forget a local path whose file is gone.
    pub async fn clear_local_path(&self, codigo: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE catalog SET local_path = NULL, synced_at = NULL WHERE codigo = ?")
            .bind(codigo)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Count a failed download attempt.
    pub async fn record_failure(&self, codigo: &str, error: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE catalog SET attempts = attempts + 1, last_error = ? WHERE codigo = ?")
            .bind(error)
            .bind(codigo)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Mark a row whose code the authority no longer has.
    ///
    /// Returns `true` only the first time, so callers report it once.
    pub async fn mark_orphaned(&self, codigo: &str, now: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE catalog SET orphaned_at = ? WHERE codigo = ? AND orphaned_at IS NULL",
        )
        .bind(now)
        .bind(codigo)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_catalog_row(&self, codigo: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM catalog WHERE codigo = ?")
            .bind(codigo)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Catalog reads
    // =========================================================================

    pub async fn get_catalog_row(
        &self,
        codigo: &CatalogCode,
    ) -> Result<Option<CatalogRow>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, CatalogRow>("SELECT * FROM catalog WHERE codigo = ?")
                .bind(codigo.as_str())
                .fetch_optional(self.pool())
                .await?,
        )
    }

    /// Every row not yet on disk, oldest discovered first.
    pub async fn list_pending(&self) -> Result<Vec<CatalogRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, CatalogRow>(
            "SELECT * FROM catalog WHERE local_path IS NULL ORDER BY discovered_at, codigo",
        )
        .fetch_all(self.pool())
        .await?)
    }

    /// Pending rows eligible for download (not orphaned), oldest first.
    pub async fn eligible_pending(&self, limit: u32) -> Result<Vec<CatalogRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, CatalogRow>(
            r"
            SELECT * FROM catalog
            WHERE local_path IS NULL AND orphaned_at IS NULL
            ORDER BY discovered_at, codigo
            LIMIT ?
            ",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn count_eligible_pending(&self) -> Result<i64, DatabaseError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM catalog WHERE local_path IS NULL AND orphaned_at IS NULL",
        )
        .fetch_one(self.pool())
        .await?)
    }

    /// Rows that claim to have media on disk.
    pub async fn rows_with_local_path(&self) -> Result<Vec<CatalogRow>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, CatalogRow>("SELECT * FROM catalog WHERE local_path IS NOT NULL")
                .fetch_all(self.pool())
                .await?,
        )
    }

    /// Search by code prefix, artist or title. Orphans are left out when
    /// `hide_orphans` is set.
    pub async fn search_catalog(
        &self,
        query: &str,
        limit: u32,
        hide_orphans: bool,
    ) -> Result<Vec<CatalogRow>, DatabaseError> {
        let escaped = query
            .trim()
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let prefix = format!("{escaped}%");
        let contains = format!("%{escaped}%");

        Ok(sqlx::query_as::<_, CatalogRow>(
            r"
            SELECT * FROM catalog
            WHERE (codigo LIKE ? ESCAPE '\'
                   OR artista LIKE ? ESCAPE '\'
                   OR titulo LIKE ? ESCAPE '\')
              AND (? = 0 OR orphaned_at IS NULL)
            ORDER BY (local_path IS NULL), artista, titulo, codigo
            LIMIT ?
            ",
        )
        .bind(&prefix)
        .bind(&contains)
        .bind(&contains)
        .bind(hide_orphans)
        .bind(limit)
        .fetch_all(self.pool())
        .await?)
    }

    /// The `offset`-th downloaded row in code order.
    pub async fn local_row_at(
        &self,
        offset: i64,
        hide_orphans: bool,
    ) -> Result<Option<CatalogRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, CatalogRow>(
            r"
            SELECT * FROM catalog
            WHERE local_path IS NOT NULL AND (? = 0 OR orphaned_at IS NULL)
            ORDER BY codigo
            LIMIT 1 OFFSET ?
            ",
        )
        .bind(hide_orphans)
        .bind(offset)
        .fetch_optional(self.pool())
        .await?)
    }

    /// Totals over the mirror. No network involved.
    pub async fn offline_status(&self, hide_orphans: bool) -> Result<OfflineStatus, DatabaseError> {
        let (total, local, pending, bytes): (i64, i64, i64, i64) = sqlx::query_as(
            r"
            SELECT
                COUNT(*),
                COALESCE(SUM(local_path IS NOT NULL), 0),
                COALESCE(SUM(local_path IS NULL), 0),
                COALESCE(SUM(CASE WHEN local_path IS NOT NULL THEN size ELSE 0 END), 0)
            FROM catalog
            WHERE ? = 0 OR orphaned_at IS NULL
            ",
        )
        .bind(hide_orphans)
        .fetch_one(self.pool())
        .await?;

        Ok(OfflineStatus {
            total_catalog: total,
            total_local: local,
            total_pending_remote: pending,
            bytes_used: bytes,
        })
    }
}
