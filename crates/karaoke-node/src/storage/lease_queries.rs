//! Lease and node state queries.

use super::db::{DatabaseError, LocalStore};
use super::models::LeaseRow;

const DEVICE_ID: &str = "device_id";

impl LocalStore {
    // =========================================================================
    // Lease queries
    // =========================================================================

    /// Read the lease row, if any.
    pub async fn get_lease(&self) -> Result<Option<LeaseRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, LeaseRow>(
            r"
            SELECT key, kind, activated_at, time_budget_days, expires_at,
                   dias_restantes, horas_restantes, revoked, last_validated_at
            FROM lease WHERE id = 1
            ",
        )
        .fetch_optional(self.pool())
        .await?)
    }

    /// Create or overwrite the lease row.
    pub async fn put_lease(&self, lease: &LeaseRow) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO lease (id, key, kind, activated_at, time_budget_days, expires_at,
                               dias_restantes, horas_restantes, revoked, last_validated_at)
            VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                key = excluded.key,
                kind = excluded.kind,
                activated_at = excluded.activated_at,
                time_budget_days = excluded.time_budget_days,
                expires_at = excluded.expires_at,
                dias_restantes = excluded.dias_restantes,
                horas_restantes = excluded.horas_restantes,
                revoked = excluded.revoked,
                last_validated_at = excluded.last_validated_at
            ",
        )
        .bind(&lease.key)
        .bind(&lease.kind)
        .bind(lease.activated_at)
        .bind(lease.time_budget_days)
        .bind(lease.expires_at)
        .bind(lease.dias_restantes)
        .bind(lease.horas_restantes)
        .bind(lease.revoked)
        .bind(lease.last_validated_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Flag the lease as revoked, but only if it still holds `key`.
    pub async fn mark_lease_revoked(&self, key: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE lease SET revoked = 1 WHERE id = 1 AND key = ?")
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete the lease row. Returns `false` if there was none.
    pub async fn delete_lease(&self) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM lease WHERE id = 1")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Node state queries
    // =========================================================================

    pub async fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        Ok(
            sqlx::query_scalar::<_, String>("SELECT value FROM node_state WHERE key = ?")
                .bind(key)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    pub async fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO node_state (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// The persisted device fingerprint, generated on first call.
    pub async fn device_id(&self) -> Result<String, DatabaseError> {
        sqlx::query("INSERT INTO node_state (key, value) VALUES (?, ?) ON CONFLICT(key) DO NOTHING")
            .bind(DEVICE_ID)
            .bind(uuid::Uuid::new_v4().to_string())
            .execute(self.pool())
            .await?;

        self.get_state(DEVICE_ID)
            .await?
            .ok_or_else(|| DatabaseError::NotFound("device id".into()))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn lease(key: &str) -> LeaseRow {
        LeaseRow {
            key: key.into(),
            kind: "machine".into(),
            activated_at: Some(100),
            time_budget_days: Some(7),
            expires_at: Some(100 + 7 * 86_400),
            dias_restantes: Some(7),
            horas_restantes: Some(168.0),
            revoked: false,
            last_validated_at: 100,
        }
    }

    #[tokio::test]
    async fn lease_is_a_single_row() {
        let db = LocalStore::open_in_memory().await.unwrap();
        assert!(db.get_lease().await.unwrap().is_none());

        db.put_lease(&lease("ABCD-1234-EFGH-5678")).await.unwrap();
        db.put_lease(&lease("WXYZ-1234-EFGH-5678")).await.unwrap();

        let stored = db.get_lease().await.unwrap().unwrap();
        assert_eq!(stored.key, "WXYZ-1234-EFGH-5678");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lease")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn revoke_only_matches_current_key() {
        let db = LocalStore::open_in_memory().await.unwrap();
        db.put_lease(&lease("ABCD-1234-EFGH-5678")).await.unwrap();

        assert!(!db.mark_lease_revoked("WXYZ-1234-EFGH-5678").await.unwrap());
        assert!(db.mark_lease_revoked("ABCD-1234-EFGH-5678").await.unwrap());
        assert!(db.get_lease().await.unwrap().unwrap().revoked);

        assert!(db.delete_lease().await.unwrap());
        assert!(!db.delete_lease().await.unwrap());
    }

    #[tokio::test]
    async fn device_id_is_stable() {
        let db = LocalStore::open_in_memory().await.unwrap();
        let first = db.device_id().await.unwrap();
        let second = db.device_id().await.unwrap();
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }

    #[tokio::test]
    async fn state_values_overwrite() {
        let db = LocalStore::open_in_memory().await.unwrap();
        db.set_state("cursor", "1").await.unwrap();
        db.set_state("cursor", "2").await.unwrap();
        assert_eq!(db.get_state("cursor").await.unwrap().as_deref(), Some("2"));
        assert!(db.get_state("missing").await.unwrap().is_none());
    }
}
