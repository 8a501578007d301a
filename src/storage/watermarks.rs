use anyhow::Result;
use chrono::Utc;

use super::schema::Database;

impl Database {
    // ========================================================================
    // Watermark Operations
    // ========================================================================

    /// Load every persisted watermark as `(key, timestamp_ms)`.
    pub async fn load_watermarks(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT key, timestamp_ms FROM watermarks ORDER BY key")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Upsert one watermark. The stored value never decreases, even if writes
    /// arrive out of order.
    pub async fn save_watermark(&self, key: &str, timestamp_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watermarks (key, timestamp_ms, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                timestamp_ms = MAX(timestamp_ms, excluded.timestamp_ms),
                updated_at = excluded.updated_at
        "#,
        )
        .bind(key)
        .bind(timestamp_ms)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove watermarks whose keys are not in `keep`. Returns rows deleted.
    pub async fn prune_watermarks(&self, keep: &[String]) -> Result<u64> {
        let stored = self.load_watermarks().await?;
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for (key, _) in stored.iter().filter(|(k, _)| !keep.contains(k)) {
            removed += sqlx::query("DELETE FROM watermarks WHERE key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }
}
