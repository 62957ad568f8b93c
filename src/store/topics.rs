use super::*;
use sqlx::Row;

/// Field-level merge for `update_topic`. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct TopicPatch {
    pub summary: Option<String>,
    /// JSON array of keyword strings.
    pub keywords: Option<String>,
    /// Added to the stored message_count.
    pub add_messages: Option<i64>,
}

impl SqliteStore {
    pub async fn save_topic(
        &self,
        session_id: &str,
        title: &str,
        keywords: &[String],
        summary: &str,
        message_count: i64,
    ) -> anyhow::Result<i64> {
        let now = to_ts(Utc::now());
        let result = sqlx::query(
            "INSERT INTO topics (session_id, title, keywords, summary, message_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(title)
        .bind(serde_json::to_string(keywords)?)
        .bind(summary)
        .bind(message_count)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Most recently updated topics first.
    pub async fn get_topics(&self, session_id: &str, limit: u32) -> anyhow::Result<Vec<TopicRow>> {
        let rows = sqlx::query(
            "SELECT * FROM topics WHERE session_id = ?
             ORDER BY updated_at DESC, id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(topic_from_row).collect()
    }

    pub async fn update_topic(&self, id: i64, patch: &TopicPatch) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE topics SET
                 summary = COALESCE(?, summary),
                 keywords = COALESCE(?, keywords),
                 message_count = message_count + ?,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(&patch.summary)
        .bind(&patch.keywords)
        .bind(patch.add_messages.unwrap_or(0))
        .bind(to_ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Keep only the `keep` most recently updated topics for the session.
    pub async fn prune_topics(&self, session_id: &str, keep: u32) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM topics WHERE session_id = ? AND id NOT IN (
                 SELECT id FROM topics WHERE session_id = ?
                 ORDER BY updated_at DESC, id DESC LIMIT ?
             )",
        )
        .bind(session_id)
        .bind(session_id)
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn topic_from_row(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<TopicRow> {
    Ok(TopicRow {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        title: row.try_get("title")?,
        keywords: row.try_get("keywords")?,
        summary: row.try_get("summary")?,
        message_count: row.try_get("message_count")?,
        created_at: from_ts(row.try_get::<String, _>("created_at")?.as_str()),
        updated_at: from_ts(row.try_get::<String, _>("updated_at")?.as_str()),
    })
}
