use super::*;
use sqlx::Row;

/// An inbound or outbound message about to be appended. Messages are
/// immutable once saved.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub user_role: Option<String>,
    pub user_title: Option<String>,
    pub group_id: Option<i64>,
    pub group_name: Option<String>,
    pub message_id: Option<i64>,
}

impl SqliteStore {
    /// Append-only; no dedup.
    pub async fn save_message(&self, msg: &NewMessage) -> anyhow::Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages
                (session_id, role, content, user_id, user_name, user_role,
                 user_title, group_id, group_name, timestamp, message_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.session_id)
        .bind(&msg.role)
        .bind(&msg.content)
        .bind(msg.user_id)
        .bind(&msg.user_name)
        .bind(&msg.user_role)
        .bind(&msg.user_title)
        .bind(msg.group_id)
        .bind(&msg.group_name)
        .bind(to_ts(Utc::now()))
        .bind(msg.message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Last `limit` messages in ascending time order. With `before`, only
    /// rows strictly older than it.
    pub async fn get_messages(
        &self,
        session_id: &str,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<MessageRow>> {
        let rows = match before {
            Some(before) => {
                sqlx::query(
                    "SELECT * FROM messages
                     WHERE session_id = ? AND timestamp < ?
                     ORDER BY timestamp DESC, id DESC LIMIT ?",
                )
                .bind(session_id)
                .bind(to_ts(before))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM messages
                     WHERE session_id = ?
                     ORDER BY timestamp DESC, id DESC LIMIT ?",
                )
                .bind(session_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut messages = rows
            .into_iter()
            .map(message_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// A user's recent messages, optionally confined to one session,
    /// ascending time order.
    pub async fn get_messages_by_user(
        &self,
        user_id: i64,
        session_id: Option<&str>,
        limit: u32,
    ) -> anyhow::Result<Vec<MessageRow>> {
        let rows = match session_id {
            Some(session_id) => {
                sqlx::query(
                    "SELECT * FROM messages
                     WHERE user_id = ? AND session_id = ?
                     ORDER BY timestamp DESC, id DESC LIMIT ?",
                )
                .bind(user_id)
                .bind(session_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM messages
                     WHERE user_id = ?
                     ORDER BY timestamp DESC, id DESC LIMIT ?",
                )
                .bind(user_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut messages = rows
            .into_iter()
            .map(message_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Substring match on content within a session, newest matches first in
    /// the scan, returned ascending.
    pub async fn search_messages(
        &self,
        session_id: &str,
        keyword: &str,
        limit: u32,
    ) -> anyhow::Result<Vec<MessageRow>> {
        let pattern = format!("%{}%", escape_like(keyword));
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE session_id = ? AND content LIKE ? ESCAPE '\\'
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .into_iter()
            .map(message_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }
}

fn escape_like(keyword: &str) -> String {
    keyword
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn message_from_row(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<MessageRow> {
    Ok(MessageRow {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        role: row.try_get("role")?,
        content: row.try_get("content")?,
        user_id: row.try_get("user_id")?,
        user_name: row.try_get("user_name")?,
        user_role: row.try_get("user_role")?,
        user_title: row.try_get("user_title")?,
        group_id: row.try_get("group_id")?,
        group_name: row.try_get("group_name")?,
        timestamp: from_ts(row.try_get::<String, _>("timestamp")?.as_str()),
        message_id: row.try_get("message_id")?,
    })
}
