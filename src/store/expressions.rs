use super::*;
use sqlx::Row;

impl SqliteStore {
    pub async fn save_expression(
        &self,
        session_id: &str,
        user_id: i64,
        user_name: &str,
        situation: &str,
        style: &str,
        example: &str,
    ) -> anyhow::Result<i64> {
        let result = sqlx::query(
            "INSERT INTO expressions (session_id, user_id, user_name, situation, style, example, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(user_id)
        .bind(user_name)
        .bind(situation)
        .bind(style)
        .bind(example)
        .bind(to_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Newest expressions first.
    pub async fn get_expressions(
        &self,
        session_id: &str,
        limit: u32,
    ) -> anyhow::Result<Vec<ExpressionRow>> {
        let rows = sqlx::query(
            "SELECT * FROM expressions WHERE session_id = ?
             ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(expression_from_row).collect()
    }

    pub async fn get_expression_count(&self, session_id: &str) -> anyhow::Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM expressions WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Delete oldest-first until only the `keep_count` newest remain.
    pub async fn delete_oldest_expressions(
        &self,
        session_id: &str,
        keep_count: u32,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM expressions WHERE session_id = ? AND id NOT IN (
                 SELECT id FROM expressions WHERE session_id = ?
                 ORDER BY created_at DESC, id DESC LIMIT ?
             )",
        )
        .bind(session_id)
        .bind(session_id)
        .bind(keep_count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn expression_from_row(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<ExpressionRow> {
    Ok(ExpressionRow {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        user_name: row.try_get("user_name")?,
        situation: row.try_get("situation")?,
        style: row.try_get("style")?,
        example: row.try_get("example")?,
        created_at: from_ts(row.try_get::<String, _>("created_at")?.as_str()),
    })
}
