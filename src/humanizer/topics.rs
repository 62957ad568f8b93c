//! Topic tracker: batches inbound traffic per session and periodically asks
//! the model to name what the group is talking about.
//!
//! Analysis runs detached from the hot path; the tracker only bumps
//! counters there. Returned topics merge into existing rows when the title
//! matches exactly or the character-set overlap is high.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use super::parse_lenient_json;
use crate::config::TopicConfig;
use crate::store::{SqliteStore, TopicPatch, TopicRow};
use crate::traits::{ChatOptions, LlmClient};

const ANALYSIS_HISTORY_LIMIT: u32 = 80;
const EXISTING_TOPICS_SHOWN: u32 = 20;
const STALE_CHECK_MIN_MESSAGES: u32 = 15;
const TITLE_SIMILARITY_THRESHOLD: f64 = 0.7;

struct Counter {
    messages_since_check: u32,
    last_check: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TopicTracker {
    llm: Arc<dyn LlmClient>,
    store: Arc<SqliteStore>,
    cfg: TopicConfig,
    model: String,
    counters: Arc<Mutex<HashMap<String, Counter>>>,
}

impl TopicTracker {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<SqliteStore>,
        cfg: TopicConfig,
        model: String,
    ) -> Self {
        Self {
            llm,
            store,
            cfg,
            model,
            counters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Count an inbound message; spawn an analysis pass when the batch is
    /// big enough or the session has gone unchecked too long.
    pub fn on_message(&self, session_id: &str) {
        if !self.cfg.enabled {
            return;
        }

        let batch_size = {
            let mut counters = self.counters.lock().unwrap();
            let counter = counters.entry(session_id.to_string()).or_insert(Counter {
                messages_since_check: 0,
                last_check: Utc::now(),
            });
            counter.messages_since_check += 1;

            let stale = (Utc::now() - counter.last_check).num_milliseconds().max(0) as u64
                > self.cfg.time_threshold_ms;
            let due = counter.messages_since_check >= self.cfg.message_threshold
                || (stale && counter.messages_since_check >= STALE_CHECK_MIN_MESSAGES);
            if !due {
                return;
            }
            let batch = counter.messages_since_check;
            counter.messages_since_check = 0;
            counter.last_check = Utc::now();
            batch
        };

        let tracker = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = tracker.analyze(&session_id, batch_size as i64).await {
                warn!(session_id = %session_id, error = %e, "topic analysis failed");
            }
        });
    }

    async fn analyze(&self, session_id: &str, batch_size: i64) -> anyhow::Result<()> {
        let history = self
            .store
            .get_messages(session_id, ANALYSIS_HISTORY_LIMIT, None)
            .await?;
        if history.is_empty() {
            return Ok(());
        }
        let existing = self
            .store
            .get_topics(session_id, EXISTING_TOPICS_SHOWN)
            .await?;

        let mut prompt = String::from(
            "分析下面这段群聊在讨论什么话题。输出 JSON:\n\
             {\"topics\": [{\"title\": \"话题名\", \"keywords\": [\"关键词\"], \
             \"summary\": \"一两句概括\", \"is_continuation\": true|false}]}\n\
             最多 3 个话题。已知话题里延续的讨论请沿用原标题。\n\n",
        );
        if !existing.is_empty() {
            prompt.push_str("已知话题: ");
            prompt.push_str(
                &existing
                    .iter()
                    .map(|t| t.title.as_str())
                    .collect::<Vec<_>>()
                    .join("、"),
            );
            prompt.push_str("\n\n");
        }
        prompt.push_str("聊天记录:\n");
        for msg in &history {
            let speaker = msg.user_name.as_deref().unwrap_or(&msg.role);
            prompt.push_str(&format!("{}: {}\n", speaker, msg.content));
        }

        let messages = vec![json!({"role": "user", "content": prompt})];
        let text = self
            .llm
            .generate_text(
                &self.model,
                &messages,
                &ChatOptions {
                    temperature: Some(0.3),
                    max_tokens: Some(600),
                },
            )
            .await?;

        let Some(value) = parse_lenient_json(&text) else {
            anyhow::bail!("unparseable topic analysis output");
        };
        let Some(topics) = value.get("topics").and_then(|v| v.as_array()) else {
            anyhow::bail!("topic analysis output missing 'topics'");
        };

        for topic in topics {
            let Some(title) = topic.get("title").and_then(|v| v.as_str()) else {
                continue;
            };
            let title = title.trim();
            if title.is_empty() {
                continue;
            }
            let keywords: Vec<String> = topic
                .get("keywords")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|k| k.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let summary = topic
                .get("summary")
                .and_then(|v| v.as_str())
                .unwrap_or_default();

            match find_matching(&existing, title) {
                Some(row) => {
                    debug!(session_id, title, "updating existing topic");
                    self.store
                        .update_topic(
                            row.id,
                            &TopicPatch {
                                summary: Some(summary.to_string()),
                                keywords: Some(serde_json::to_string(&keywords)?),
                                add_messages: Some(batch_size),
                            },
                        )
                        .await?;
                }
                None => {
                    debug!(session_id, title, "new topic");
                    self.store
                        .save_topic(session_id, title, &keywords, summary, batch_size)
                        .await?;
                }
            }
        }

        self.store
            .prune_topics(session_id, self.cfg.max_topics_per_session)
            .await?;
        Ok(())
    }

    /// Short topic listing for the system prompt.
    pub async fn topic_context(&self, session_id: &str) -> Option<String> {
        if !self.cfg.enabled {
            return None;
        }
        let topics = match self.store.get_topics(session_id, 5).await {
            Ok(topics) => topics,
            Err(e) => {
                warn!(session_id, error = %e, "topic context load failed");
                return None;
            }
        };
        if topics.is_empty() {
            return None;
        }
        let lines: Vec<String> = topics
            .iter()
            .map(|t| {
                if t.summary.is_empty() {
                    format!("- {}", t.title)
                } else {
                    format!("- {}: {}", t.title, t.summary)
                }
            })
            .collect();
        Some(lines.join("\n"))
    }
}

fn find_matching<'a>(existing: &'a [TopicRow], title: &str) -> Option<&'a TopicRow> {
    existing.iter().find(|row| {
        row.title == title || char_jaccard(&row.title, title) > TITLE_SIMILARITY_THRESHOLD
    })
}

/// Jaccard similarity over the character sets of two strings.
fn char_jaccard(a: &str, b: &str) -> f64 {
    let sa: HashSet<char> = a.chars().collect();
    let sb: HashSet<char> = b.chars().collect();
    if sa.is_empty() && sb.is_empty() {
        return 1.0;
    }
    let intersection = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    intersection as f64 / union as f64
}
