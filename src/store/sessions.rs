use super::*;
use sqlx::Row;

impl SqliteStore {
    pub async fn get_session(&self, id: &str) -> anyhow::Result<Option<SessionRow>> {
        let row = sqlx::query(
            "SELECT id, kind, target_id, created_at, updated_at, compressed_context
             FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(session_from_row).transpose()?)
    }

    pub async fn create_session(
        &self,
        id: &str,
        kind: SessionKind,
        target_id: i64,
    ) -> anyhow::Result<SessionRow> {
        let now = Utc::now();
        sqlx::query(
            "INSERT OR IGNORE INTO sessions (id, kind, target_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(target_id)
        .bind(to_ts(now))
        .bind(to_ts(now))
        .execute(&self.pool)
        .await?;

        self.get_session(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session {id} missing after insert"))
    }

    pub async fn touch_session(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(to_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete all messages and clear the compressed context. The session row
    /// itself survives so its identity is stable across resets.
    pub async fn reset_session(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("UPDATE sessions SET compressed_context = NULL, updated_at = ? WHERE id = ?")
            .bind(to_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_compressed_context(&self, id: &str, context: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET compressed_context = ?, updated_at = ? WHERE id = ?")
            .bind(context)
            .bind(to_ts(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn session_from_row(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<SessionRow> {
    Ok(SessionRow {
        id: row.try_get("id")?,
        kind: SessionKind::parse(row.try_get::<String, _>("kind")?.as_str()),
        target_id: row.try_get("target_id")?,
        created_at: from_ts(row.try_get::<String, _>("created_at")?.as_str()),
        updated_at: from_ts(row.try_get::<String, _>("updated_at")?.as_str()),
        compressed_context: row.try_get("compressed_context")?,
    })
}
