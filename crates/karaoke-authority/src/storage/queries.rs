//! Database queries for the karaoke authority.

use karaoke_core::catalog::CatalogCode;
use karaoke_core::db::unix_timestamp;
use karaoke_core::license::{ActivationKey, KeyKind, KeyPatch, KeyStatus, LicenseKey};
use karaoke_core::wire::HistoryRecord;

use super::db::{AuthorityDatabase, DatabaseError};
use super::models::{ActivationKeyRow, CatalogRow, HistoryInsert, NewCatalogEntry};

impl AuthorityDatabase {
    // =========================================================================
    // Activation key queries
    // =========================================================================

    /// Issue a new activation key.
    pub async fn insert_key(
        &self,
        key: &LicenseKey,
        kind: KeyKind,
        time_budget_days: Option<i64>,
        expires_at: Option<i64>,
    ) -> Result<ActivationKeyRow, DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO activation_keys (key, kind, time_budget_days, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(key.as_str())
        .bind(kind.as_str())
        .bind(time_budget_days)
        .bind(expires_at)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_key(key.as_str())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Activation key {}", key.redacted())))
    }

    /// Get an activation key by its canonical text.
    pub async fn get_key(&self, key: &str) -> Result<Option<ActivationKeyRow>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, ActivationKeyRow>("SELECT * FROM activation_keys WHERE key = ?")
                .bind(key)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    /// List all activation keys, newest first.
    pub async fn list_keys(&self) -> Result<Vec<ActivationKeyRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, ActivationKeyRow>(
            "SELECT * FROM activation_keys ORDER BY created_at DESC, key",
        )
        .fetch_all(self.pool())
        .await?)
    }

    /// Persist a reconcile patch if the record still looks like `seen`.
    ///
    /// Returns `false` when another validation changed the status, binding,
    /// or activation time in between; the caller re-reads and retries.
    pub async fn apply_key_patch(
        &self,
        seen: &ActivationKey,
        patch: &KeyPatch,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            UPDATE activation_keys SET
                status = COALESCE(?, status),
                bound_device_id = COALESCE(?, bound_device_id),
                activated_at = COALESCE(?, activated_at),
                expires_at = COALESCE(?, expires_at),
                last_used_at = COALESCE(?, last_used_at)
            WHERE key = ?
              AND status = ?
              AND bound_device_id IS ?
              AND activated_at IS ?
            ",
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.bound_device_id.as_deref())
        .bind(patch.activated_at)
        .bind(patch.expires_at)
        .bind(patch.last_used_at)
        .bind(seen.key.as_str())
        .bind(seen.status.as_str())
        .bind(seen.bound_device_id.as_deref())
        .bind(seen.activated_at)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Clear a key's device binding. Returns `false` if the key is unknown.
    pub async fn unbind_key(&self, key: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE activation_keys SET bound_device_id = NULL WHERE key = ?")
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Revoke a key. Terminal; returns `false` if the key is unknown.
    pub async fn revoke_key(&self, key: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE activation_keys SET status = ? WHERE key = ?")
            .bind(KeyStatus::Revoked.as_str())
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Catalog queries
    // =========================================================================

    /// Publish or update a song. Bumps its revision so nodes pick it up again.
    pub async fn upsert_catalog_entry(
        &self,
        entry: &NewCatalogEntry<'_>,
    ) -> Result<CatalogRow, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO catalog
                (codigo, artista, titulo, media_ref, size, duration, placeholder, revision,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, (SELECT COALESCE(MAX(revision), 0) + 1 FROM catalog), ?, ?)
            ON CONFLICT(codigo) DO UPDATE SET
                artista = excluded.artista,
                titulo = excluded.titulo,
                media_ref = excluded.media_ref,
                size = excluded.size,
                duration = excluded.duration,
                placeholder = 0,
                revision = excluded.revision,
                updated_at = excluded.updated_at
            ",
        )
        .bind(entry.codigo.as_str())
        .bind(entry.artista)
        .bind(entry.titulo)
        .bind(entry.media_ref)
        .bind(entry.size)
        .bind(entry.duration)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_catalog_row(entry.codigo).await
    }

    /// Make sure a code exists so history for it can be stored.
    ///
    /// Placeholders are never published to nodes and never overwrite a real
    /// entry.
    pub async fn upsert_placeholder(&self, codigo: &CatalogCode) -> Result<CatalogRow, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO catalog
                (codigo, artista, titulo, media_ref, placeholder, revision, created_at, updated_at)
            VALUES (?, '', '', ?, 1, (SELECT COALESCE(MAX(revision), 0) + 1 FROM catalog), ?, ?)
            ON CONFLICT(codigo) DO NOTHING
            ",
        )
        .bind(codigo.as_str())
        .bind(format!("media/{}", codigo.file_name("mp4")))
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_catalog_row(codigo).await
    }

    async fn get_catalog_row(&self, codigo: &CatalogCode) -> Result<CatalogRow, DatabaseError> {
        sqlx::query_as::<_, CatalogRow>("SELECT * FROM catalog WHERE codigo = ?")
            .bind(codigo.as_str())
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Catalog entry {codigo}")))
    }

    /// Get a published entry by code.
    pub async fn get_catalog_entry(
        &self,
        codigo: &CatalogCode,
    ) -> Result<Option<CatalogRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, CatalogRow>(
            "SELECT * FROM catalog WHERE codigo = ? AND placeholder = 0",
        )
        .bind(codigo.as_str())
        .fetch_optional(self.pool())
        .await?)
    }

    /// Published entries with a revision greater than `since`.
    pub async fn catalog_page(
        &self,
        since: i64,
        limit: u32,
    ) -> Result<Vec<CatalogRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, CatalogRow>(
            "SELECT * FROM catalog WHERE revision > ? AND placeholder = 0 ORDER BY revision LIMIT ?",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(self.pool())
        .await?)
    }

    // =========================================================================
    // History queries
    // =========================================================================

    /// Store one pushed play. Idempotent on the record id.
    pub async fn insert_history(
        &self,
        record: &HistoryRecord,
        license_key: &LicenseKey,
        device_id: &str,
    ) -> Result<HistoryInsert, DatabaseError> {
        let known: Option<i64> = sqlx::query_scalar("SELECT id FROM catalog WHERE codigo = ?")
            .bind(record.codigo.as_str())
            .fetch_optional(self.pool())
            .await?;
        if known.is_none() {
            return Ok(HistoryInsert::UnknownCode);
        }

        let result = sqlx::query(
            r"
            INSERT INTO history (id, codigo, license_key, device_id, played_at, received_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            ",
        )
        .bind(&record.id)
        .bind(record.codigo.as_str())
        .bind(license_key.as_str())
        .bind(device_id)
        .bind(record.played_at)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(if result.rows_affected() == 1 {
            HistoryInsert::Inserted
        } else {
            HistoryInsert::Duplicate
        })
    }

    /// Number of stored plays for a code.
    pub async fn count_plays(&self, codigo: &CatalogCode) -> Result<i64, DatabaseError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM history WHERE codigo = ?")
            .bind(codigo.as_str())
            .fetch_one(self.pool())
            .await?)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use karaoke_core::license::reconcile;

    use super::*;

    async fn db() -> AuthorityDatabase {
        AuthorityDatabase::open_in_memory().await.unwrap()
    }

    fn key(text: &str) -> LicenseKey {
        LicenseKey::parse(text).unwrap()
    }

    fn code(text: &str) -> CatalogCode {
        CatalogCode::parse(text).unwrap()
    }

    async fn publish(db: &AuthorityDatabase, codigo: &str) -> CatalogRow {
        let codigo = code(codigo);
        db.upsert_catalog_entry(&NewCatalogEntry {
            codigo: &codigo,
            artista: "Artist",
            titulo: "Title",
            media_ref: "media/x.mp4",
            size: Some(10),
            duration: None,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn issued_key_round_trips() {
        let db = db().await;
        let k = key("ABCD-1234-EFGH-5678");
        let row = db.insert_key(&k, KeyKind::Machine, Some(7), None).await.unwrap();
        let record = row.to_domain().unwrap();
        assert_eq!(record.key, k);
        assert_eq!(record.kind, KeyKind::Machine);
        assert_eq!(record.status, KeyStatus::Active);
        assert_eq!(record.time_budget_days, Some(7));
        assert!(record.bound_device_id.is_none());
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let db = db().await;
        let k = key("ABCD-1234-EFGH-5678");
        db.insert_key(&k, KeyKind::Machine, Some(7), None).await.unwrap();
        assert!(db.insert_key(&k, KeyKind::Machine, Some(7), None).await.is_err());
    }

    #[tokio::test]
    async fn patch_applies_when_record_unchanged() {
        let db = db().await;
        let k = key("ABCD-1234-EFGH-5678");
        let seen = db
            .insert_key(&k, KeyKind::Machine, Some(7), None)
            .await
            .unwrap()
            .to_domain()
            .unwrap();

        let r = reconcile(&seen, "D1", 1_000);
        assert!(db.apply_key_patch(&seen, &r.patch).await.unwrap());

        let stored = db.get_key(k.as_str()).await.unwrap().unwrap();
        assert_eq!(stored.bound_device_id.as_deref(), Some("D1"));
        assert_eq!(stored.activated_at, Some(1_000));
        assert_eq!(stored.last_used_at, Some(1_000));
    }

    #[tokio::test]
    async fn stale_patch_loses_the_race() {
        let db = db().await;
        let k = key("ABCD-1234-EFGH-5678");
        let seen = db
            .insert_key(&k, KeyKind::Machine, Some(7), None)
            .await
            .unwrap()
            .to_domain()
            .unwrap();

        let first = reconcile(&seen, "D1", 1_000);
        let second = reconcile(&seen, "D2", 1_001);
        assert!(db.apply_key_patch(&seen, &first.patch).await.unwrap());
        assert!(!db.apply_key_patch(&seen, &second.patch).await.unwrap());

        let stored = db.get_key(k.as_str()).await.unwrap().unwrap();
        assert_eq!(stored.bound_device_id.as_deref(), Some("D1"));
    }

    #[tokio::test]
    async fn unbind_and_revoke() {
        let db = db().await;
        let k = key("ABCD-1234-EFGH-5678");
        let seen = db
            .insert_key(&k, KeyKind::Machine, Some(7), None)
            .await
            .unwrap()
            .to_domain()
            .unwrap();
        let r = reconcile(&seen, "D1", 1_000);
        db.apply_key_patch(&seen, &r.patch).await.unwrap();

        assert!(db.unbind_key(k.as_str()).await.unwrap());
        let stored = db.get_key(k.as_str()).await.unwrap().unwrap();
        assert!(stored.bound_device_id.is_none());
        assert_eq!(stored.activated_at, Some(1_000));

        assert!(db.revoke_key(k.as_str()).await.unwrap());
        assert_eq!(db.get_key(k.as_str()).await.unwrap().unwrap().status, "revoked");
        assert!(!db.revoke_key("ZZZZ-ZZZZ-ZZZZ-ZZZZ").await.unwrap());
    }

    #[tokio::test]
    async fn catalog_pages_follow_revisions() {
        let db = db().await;
        for c in ["00001", "00002", "00003"] {
            publish(&db, c).await;
        }

        let first = db.catalog_page(0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let cursor = first[1].revision;
        let rest = db.catalog_page(cursor, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].codigo, "00003");

        // Updating an entry moves it past the cursor again.
        let updated = publish(&db, "00001").await;
        assert!(updated.revision > rest[0].revision);
        let again = db.catalog_page(rest[0].revision, 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].codigo, "00001");
    }

    #[tokio::test]
    async fn placeholders_are_not_published() {
        let db = db().await;
        let c = code("04242");
        let row = db.upsert_placeholder(&c).await.unwrap();
        assert!(row.placeholder);
        assert!(db.get_catalog_entry(&c).await.unwrap().is_none());
        assert!(db.catalog_page(0, 100).await.unwrap().is_empty());

        // A real entry replaces the placeholder; a later placeholder is a no-op.
        publish(&db, "04242").await;
        let row = db.upsert_placeholder(&c).await.unwrap();
        assert!(!row.placeholder);
        assert_eq!(row.artista, "Artist");
    }

    #[tokio::test]
    async fn history_insert_is_idempotent() {
        let db = db().await;
        let k = key("ABCD-1234-EFGH-5678");
        db.insert_key(&k, KeyKind::Machine, Some(7), None).await.unwrap();
        publish(&db, "00001").await;

        let record = HistoryRecord {
            id: "3f0c6a8e-0000-4000-8000-000000000001".into(),
            codigo: code("00001"),
            played_at: 1_000,
        };
        assert_eq!(db.insert_history(&record, &k, "D1").await.unwrap(), HistoryInsert::Inserted);
        assert_eq!(db.insert_history(&record, &k, "D1").await.unwrap(), HistoryInsert::Duplicate);
        assert_eq!(db.count_plays(&record.codigo).await.unwrap(), 1);

        let unknown = HistoryRecord {
            codigo: code("09999"),
            id: "3f0c6a8e-0000-4000-8000-000000000002".into(),
            played_at: 1_000,
        };
        assert_eq!(
            db.insert_history(&unknown, &k, "D1").await.unwrap(),
            HistoryInsert::UnknownCode
        );
    }
}
