//! Expression learner: observes how group members phrase things and distills
//! reusable speaking habits the bot can imitate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use serde_json::json;
use tracing::{debug, warn};

use super::parse_lenient_json;
use crate::config::ExpressionConfig;
use crate::store::SqliteStore;
use crate::traits::{ChatOptions, LlmClient};

const BATCH_SIZE: usize = 30;
const MIN_MESSAGES_PER_USER: usize = 3;

#[derive(Clone)]
struct Buffered {
    user_id: i64,
    user_name: String,
    content: String,
}

#[derive(Clone)]
pub struct ExpressionLearner {
    llm: Arc<dyn LlmClient>,
    store: Arc<SqliteStore>,
    cfg: ExpressionConfig,
    model: String,
    buffers: Arc<Mutex<HashMap<String, Vec<Buffered>>>>,
}

impl ExpressionLearner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<SqliteStore>,
        cfg: ExpressionConfig,
        model: String,
    ) -> Self {
        Self {
            llm,
            store,
            cfg,
            model,
            buffers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Buffer an inbound user message; flush a full batch into a detached
    /// learning pass.
    pub fn on_message(&self, session_id: &str, user_id: i64, user_name: &str, content: &str) {
        if !self.cfg.enabled || content.trim().is_empty() {
            return;
        }

        let batch = {
            let mut buffers = self.buffers.lock().unwrap();
            let buffer = buffers.entry(session_id.to_string()).or_default();
            buffer.push(Buffered {
                user_id,
                user_name: user_name.to_string(),
                content: content.to_string(),
            });
            if buffer.len() < BATCH_SIZE {
                return;
            }
            std::mem::take(buffer)
        };

        let learner = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = learner.learn(&session_id, batch).await {
                warn!(session_id = %session_id, error = %e, "expression learning failed");
            }
        });
    }

    async fn learn(&self, session_id: &str, batch: Vec<Buffered>) -> anyhow::Result<()> {
        let mut by_user: HashMap<i64, Vec<&Buffered>> = HashMap::new();
        for msg in &batch {
            by_user.entry(msg.user_id).or_default().push(msg);
        }

        for (user_id, messages) in by_user {
            if messages.len() < MIN_MESSAGES_PER_USER {
                continue;
            }
            let user_name = messages[0].user_name.clone();
            if let Err(e) = self
                .learn_for_user(session_id, user_id, &user_name, &messages)
                .await
            {
                warn!(session_id, user_id, error = %e, "per-user habit extraction failed");
            }
        }

        // Enforce the per-session cap after the whole batch lands.
        let count = self.store.get_expression_count(session_id).await?;
        if count > self.cfg.max_expressions as i64 {
            let removed = self
                .store
                .delete_oldest_expressions(session_id, self.cfg.max_expressions)
                .await?;
            debug!(session_id, removed, "pruned old expressions");
        }
        Ok(())
    }

    async fn learn_for_user(
        &self,
        session_id: &str,
        user_id: i64,
        user_name: &str,
        messages: &[&Buffered],
    ) -> anyhow::Result<()> {
        let mut prompt = format!(
            "下面是群成员\"{user_name}\"最近的发言。总结 2-4 条这个人的说话习惯。\n\
             输出 JSON: {{\"habits\": [{{\"situation\": \"什么场合\", \
             \"style\": \"怎么说\", \"example\": \"原话例子\"}}]}}\n\n发言:\n"
        );
        for msg in messages {
            prompt.push_str(&format!("- {}\n", msg.content));
        }

        let text = self
            .llm
            .generate_text(
                &self.model,
                &[json!({"role": "user", "content": prompt})],
                &ChatOptions {
                    temperature: Some(0.4),
                    max_tokens: Some(500),
                },
            )
            .await?;

        let Some(value) = parse_lenient_json(&text) else {
            anyhow::bail!("unparseable habit output");
        };
        let habits = value
            .get("habits")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        for habit in habits.iter().take(4) {
            let situation = habit.get("situation").and_then(|v| v.as_str()).unwrap_or("");
            let style = habit.get("style").and_then(|v| v.as_str()).unwrap_or("");
            let example = habit.get("example").and_then(|v| v.as_str()).unwrap_or("");
            if style.is_empty() {
                continue;
            }
            self.store
                .save_expression(session_id, user_id, user_name, situation, style, example)
                .await?;
        }
        Ok(())
    }

    /// A shuffled sample of learned habits, formatted for prompt injection.
    pub async fn expression_context(&self, session_id: &str) -> Option<String> {
        if !self.cfg.enabled {
            return None;
        }
        let pool_size = self.cfg.sample_size * 3;
        let mut rows = match self.store.get_expressions(session_id, pool_size).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(session_id, error = %e, "expression context load failed");
                return None;
            }
        };
        if rows.is_empty() {
            return None;
        }

        rows.shuffle(&mut rand::thread_rng());
        rows.truncate(self.cfg.sample_size as usize);

        let lines: Vec<String> = rows
            .iter()
            .map(|e| {
                if e.situation.is_empty() {
                    format!("- {}（如：{}）", e.style, e.example)
                } else {
                    format!("- {}时，{}（如：{}）", e.situation, e.style, e.example)
                }
            })
            .collect();
        Some(lines.join("\n"))
    }
}
