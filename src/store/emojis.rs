use super::*;
use sqlx::Row;

impl SqliteStore {
    /// Register a sticker file. Duplicate file names are ignored; returns
    /// true when a new row was inserted.
    pub async fn save_emoji(
        &self,
        file_name: &str,
        description: &str,
        emotion: &str,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO emojis (file_name, description, emotion, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(file_name)
        .bind(description)
        .bind(emotion)
        .bind(to_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn has_emoji(&self, file_name: &str) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT 1 FROM emojis WHERE file_name = ?")
            .bind(file_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Most-used first within one emotion label.
    pub async fn get_emojis_by_emotion(
        &self,
        emotion: &str,
        limit: u32,
    ) -> anyhow::Result<Vec<EmojiRow>> {
        let rows = sqlx::query(
            "SELECT * FROM emojis WHERE emotion = ?
             ORDER BY usage_count DESC, id ASC LIMIT ?",
        )
        .bind(emotion)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(emoji_from_row).collect()
    }

    pub async fn get_all_emojis(&self) -> anyhow::Result<Vec<EmojiRow>> {
        let rows = sqlx::query("SELECT * FROM emojis ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(emoji_from_row).collect()
    }

    pub async fn increment_emoji_usage(&self, id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE emojis SET usage_count = usage_count + 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn emoji_from_row(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<EmojiRow> {
    Ok(EmojiRow {
        id: row.try_get("id")?,
        file_name: row.try_get("file_name")?,
        description: row.try_get("description")?,
        emotion: row.try_get("emotion")?,
        usage_count: row.try_get("usage_count")?,
        created_at: from_ts(row.try_get::<String, _>("created_at")?.as_str()),
    })
}
