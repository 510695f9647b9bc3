//! Play history queries.

use super::db::{DatabaseError, LocalStore};
use super::models::HistoryRow;

impl LocalStore {
    /// Record a play. Never touches the network.
    pub async fn insert_play(
        &self,
        id: &str,
        codigo: &str,
        played_at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO history (id, codigo, played_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(codigo)
            .bind(played_at)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Snapshot of plays not yet accepted by the authority, oldest first.
    pub async fn unsynced_history(&self) -> Result<Vec<HistoryRow>, DatabaseError> {
        Ok(sqlx::query_as::<_, HistoryRow>(
            "SELECT * FROM history WHERE synced_at IS NULL ORDER BY played_at, id",
        )
        .fetch_all(self.pool())
        .await?)
    }

    /// Set the sync marker on the given ids.
    pub async fn mark_history_synced(&self, ids: &[String], now: i64) -> Result<u64, DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let mut marked = 0;
        for id in ids {
            marked += sqlx::query("UPDATE history SET synced_at = ? WHERE id = ? AND synced_at IS NULL")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(marked)
    }

    pub async fn count_unsynced_history(&self) -> Result<i64, DatabaseError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM history WHERE synced_at IS NULL")
                .fetch_one(self.pool())
                .await?,
        )
    }

    pub async fn count_history(&self) -> Result<i64, DatabaseError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM history")
            .fetch_one(self.pool())
            .await?)
    }
}
