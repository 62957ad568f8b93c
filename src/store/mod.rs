//! SQLite-backed persistence for sessions, messages, topics, expressions,
//! and emoji registrations.
//!
//! All writes go through bound-parameter queries; the pool runs in WAL mode
//! so background analyzers can read while the foreground writes.

mod emojis;
mod expressions;
mod messages;
mod migrations;
mod sessions;
mod topics;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

pub use messages::NewMessage;
pub use topics::TopicPatch;

/// Kind of conversation a session identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Group,
    Personal,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Group => "group",
            SessionKind::Personal => "personal",
        }
    }

    pub fn parse(s: &str) -> SessionKind {
        if s == "personal" {
            SessionKind::Personal
        } else {
            SessionKind::Group
        }
    }
}

/// Session key for a group conversation.
pub fn group_session_id(group_id: i64) -> String {
    format!("group:{group_id}")
}

/// Session key for a user's cross-group personal thread.
pub fn personal_session_id(user_id: i64) -> String {
    format!("personal:{user_id}")
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub kind: SessionKind,
    pub target_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub compressed_context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    pub user_role: Option<String>,
    pub user_title: Option<String>,
    pub group_id: Option<i64>,
    pub group_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// External gateway message id, when known.
    pub message_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct TopicRow {
    pub id: i64,
    pub session_id: String,
    pub title: String,
    /// JSON array of keyword strings.
    pub keywords: String,
    pub summary: String,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TopicRow {
    pub fn keyword_list(&self) -> Vec<String> {
        serde_json::from_str(&self.keywords).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct ExpressionRow {
    pub id: i64,
    pub session_id: String,
    pub user_id: i64,
    pub user_name: String,
    pub situation: String,
    pub style: String,
    pub example: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EmojiRow {
    pub id: i64,
    pub file_name: String,
    pub description: String,
    pub emotion: String,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
}

/// The persistent store. Cheap to clone via the inner pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(db_path: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))?
            .create_if_missing(true)
            .pragma("journal_mode", "WAL")
            .pragma("synchronous", "NORMAL")
            .pragma("busy_timeout", "5000");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        migrations::run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Store timestamps as RFC 3339 text.
pub(crate) fn to_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

/// Parse a stored RFC 3339 timestamp, falling back to the epoch on garbage.
pub(crate) fn from_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}
