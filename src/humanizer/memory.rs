//! Two-stage memory retrieval.
//!
//! Stage 1 asks the model whether answering the trigger needs anything from
//! stored history, producing either a key question or a sentinel. Stage 2 is
//! a small bounded search agent over the store with an iteration cap and a
//! wall-clock deadline.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::store::{MessageRow, SqliteStore};
use crate::traits::{ChatOptions, LlmClient};

const NO_RETRIEVAL_SENTINEL: &str = "NO_RETRIEVAL_NEEDED";
const QUESTION_HISTORY_WINDOW: usize = 15;
const SEARCH_RESULT_LIMIT: u32 = 10;

pub struct MemoryRetrieval {
    llm: Arc<dyn LlmClient>,
    store: Arc<SqliteStore>,
    cfg: MemoryConfig,
    model: String,
}

impl MemoryRetrieval {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<SqliteStore>,
        cfg: MemoryConfig,
        model: String,
    ) -> Self {
        Self {
            llm,
            store,
            cfg,
            model,
        }
    }

    /// Retrieve context relevant to the trigger, or nothing. Every failure
    /// path collapses to `None`; a missing memory never blocks a reply.
    pub async fn retrieve(
        &self,
        session_id: &str,
        sender_name: &str,
        trigger_text: &str,
        history: &[MessageRow],
    ) -> Option<String> {
        if !self.cfg.enabled {
            return None;
        }

        let question = match self
            .generate_question(sender_name, trigger_text, history)
            .await
        {
            Ok(Some(question)) => question,
            Ok(None) => return None,
            Err(e) => {
                warn!(session_id, error = %e, "memory question generation failed");
                return None;
            }
        };
        debug!(session_id, question = %question, "memory retrieval question");

        match self.search(session_id, &question).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(session_id, error = %e, "memory search failed");
                None
            }
        }
    }

    async fn generate_question(
        &self,
        sender_name: &str,
        trigger_text: &str,
        history: &[MessageRow],
    ) -> anyhow::Result<Option<String>> {
        let mut prompt = String::from(
            "你在群里聊天。判断回复下面这条消息是否需要查询更早的聊天记录。\n\
             如果需要，输出一个最关键的问题（一句话）；\
             如果凭最近的对话就够了，只输出 NO_RETRIEVAL_NEEDED。\n\n",
        );

        let recent: Vec<&MessageRow> = history
            .iter()
            .rev()
            .take(QUESTION_HISTORY_WINDOW)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        if !recent.is_empty() {
            prompt.push_str("最近的对话:\n");
            for msg in recent {
                let speaker = msg.user_name.as_deref().unwrap_or(&msg.role);
                prompt.push_str(&format!("{}: {}\n", speaker, msg.content));
            }
            prompt.push('\n');
        }
        prompt.push_str(&format!("{sender_name} 刚刚说: {trigger_text}\n"));

        let messages = vec![json!({"role": "user", "content": prompt})];
        let text = self
            .llm
            .generate_text(
                &self.model,
                &messages,
                &ChatOptions {
                    temperature: Some(0.3),
                    max_tokens: Some(100),
                },
            )
            .await?;

        if text.contains(NO_RETRIEVAL_SENTINEL) {
            return Ok(None);
        }
        let question = text.trim().to_string();
        if question.is_empty() {
            return Ok(None);
        }
        Ok(Some(question))
    }

    /// Bounded search loop. Terminates on `found_answer`, the iteration
    /// cap, or the deadline; leftover tool output is better than nothing.
    async fn search(&self, session_id: &str, question: &str) -> anyhow::Result<Option<String>> {
        let deadline = Instant::now() + Duration::from_millis(self.cfg.timeout_ms);
        let tools = search_tool_definitions();

        let mut messages = vec![json!({
            "role": "user",
            "content": format!(
                "使用工具在聊天记录里查找这个问题的答案: {question}\n\
                 找到后调用 found_answer；确认找不到时调用 found_answer 并把 found 设为 false。"
            ),
        })];
        let mut collected: Vec<String> = Vec::new();

        for iteration in 0..self.cfg.max_iterations {
            if Instant::now() >= deadline {
                debug!(session_id, iteration, "memory search deadline hit");
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let response = tokio::time::timeout(
                remaining,
                self.llm.complete(
                    &self.model,
                    &messages,
                    &tools,
                    &ChatOptions::with_temperature(0.2),
                ),
            )
            .await;
            let response = match response {
                Ok(result) => result?,
                Err(_) => {
                    debug!(session_id, iteration, "memory search LLM call timed out");
                    break;
                }
            };

            if response.tool_calls.is_empty() {
                break;
            }

            let mut assistant = json!({"role": "assistant", "content": response.content});
            assistant["tool_calls"] = Value::Array(
                response
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {"name": tc.name, "arguments": tc.arguments},
                        })
                    })
                    .collect(),
            );
            messages.push(assistant);

            for call in &response.tool_calls {
                let args: Value =
                    serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));

                if call.name == "found_answer" {
                    let found = args.get("found").and_then(|v| v.as_bool()).unwrap_or(false);
                    let answer = args
                        .get("answer")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    if found && !answer.is_empty() {
                        return Ok(Some(answer));
                    }
                    return Ok(None);
                }

                let result = self.run_search_tool(session_id, &call.name, &args).await;
                let result_text = match result {
                    Ok(text) => {
                        if !text.is_empty() {
                            collected.push(text.clone());
                        }
                        text
                    }
                    Err(e) => json!({"error": e.to_string()}).to_string(),
                };
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": result_text,
                }));
            }
        }

        if collected.is_empty() {
            Ok(None)
        } else {
            Ok(Some(collected.join("\n")))
        }
    }

    async fn run_search_tool(
        &self,
        session_id: &str,
        name: &str,
        args: &Value,
    ) -> anyhow::Result<String> {
        match name {
            "search_chat_history" => {
                let keyword = args
                    .get("keyword")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if keyword.is_empty() {
                    anyhow::bail!("keyword is required");
                }
                let hits = self
                    .store
                    .search_messages(session_id, keyword, SEARCH_RESULT_LIMIT)
                    .await?;
                Ok(format_hits(&hits))
            }
            "search_user_history" => {
                let user_id = args
                    .get("user_id")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| anyhow::anyhow!("user_id is required"))?;
                let hits = self
                    .store
                    .get_messages_by_user(user_id, None, SEARCH_RESULT_LIMIT)
                    .await?;
                Ok(format_hits(&hits))
            }
            other => anyhow::bail!("unknown search tool '{other}'"),
        }
    }
}

fn format_hits(hits: &[MessageRow]) -> String {
    if hits.is_empty() {
        return String::new();
    }
    hits.iter()
        .map(|m| {
            let speaker = m.user_name.as_deref().unwrap_or(&m.role);
            format!(
                "[{}] {}: {}",
                m.timestamp.format("%Y-%m-%d %H:%M"),
                speaker,
                m.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn search_tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "type": "function",
            "function": {
                "name": "search_chat_history",
                "description": "按关键词搜索本会话的聊天记录",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "keyword": {"type": "string", "description": "搜索关键词"}
                    },
                    "required": ["keyword"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "search_user_history",
                "description": "查看某个用户最近的发言（跨群）",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "user_id": {"type": "integer", "description": "用户 id"}
                    },
                    "required": ["user_id"]
                }
            }
        }),
        json!({
            "type": "function",
            "function": {
                "name": "found_answer",
                "description": "结束搜索并给出结论",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "answer": {"type": "string", "description": "找到的答案"},
                        "found": {"type": "boolean", "description": "是否确实找到了"}
                    },
                    "required": ["found"]
                }
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewMessage;
    use crate::testing::StubLlm;
    use crate::traits::{ProviderResponse, ToolCall};

    async fn setup_store() -> (Arc<SqliteStore>, tempfile::NamedTempFile) {
        let db_file = tempfile::NamedTempFile::new().unwrap();
        let store = Arc::new(
            SqliteStore::new(db_file.path().to_str().unwrap())
                .await
                .unwrap(),
        );
        (store, db_file)
    }

    fn tool_call(name: &str, arguments: &str) -> ProviderResponse {
        ProviderResponse {
            content: None,
            tool_calls: vec![ToolCall {
                id: "call-1".to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
            reasoning: None,
        }
    }

    #[tokio::test]
    async fn sentinel_short_circuits() {
        let (store, _db) = setup_store().await;
        let llm = Arc::new(StubLlm::always_text(
            "NO_RETRIEVAL_NEEDED, this is small talk",
        ));
        let retrieval =
            MemoryRetrieval::new(llm.clone(), store, MemoryConfig::default(), "m".to_string());
        assert!(retrieval.retrieve("group:1", "Bob", "hi", &[]).await.is_none());
        // Only the question stage ran.
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn found_answer_terminates_with_answer() {
        let (store, _db) = setup_store().await;
        let llm = Arc::new(StubLlm::with_responses(vec![
            ProviderResponse {
                content: Some("Bob 上次说他养了什么？".to_string()),
                ..Default::default()
            },
            tool_call("found_answer", r#"{"answer": "a cat", "found": true}"#),
        ]));
        let retrieval =
            MemoryRetrieval::new(llm, store, MemoryConfig::default(), "m".to_string());
        let result = retrieval.retrieve("group:1", "Bob", "remember my pet?", &[]).await;
        assert_eq!(result.as_deref(), Some("a cat"));
    }

    #[tokio::test]
    async fn iteration_cap_returns_collected_output() {
        let (store, _db) = setup_store().await;
        store
            .save_message(&NewMessage {
                session_id: "group:1".to_string(),
                role: "user".to_string(),
                content: "my cat is named miso".to_string(),
                user_name: Some("Bob".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        // Question, then the same search every round, never concluding.
        let llm = Arc::new(StubLlm::with_responses(vec![
            ProviderResponse {
                content: Some("what pet?".to_string()),
                ..Default::default()
            },
            tool_call("search_chat_history", r#"{"keyword": "cat"}"#),
            tool_call("search_chat_history", r#"{"keyword": "cat"}"#),
            tool_call("search_chat_history", r#"{"keyword": "cat"}"#),
            tool_call("search_chat_history", r#"{"keyword": "cat"}"#),
        ]));
        let retrieval = MemoryRetrieval::new(
            llm.clone(),
            store,
            MemoryConfig {
                max_iterations: 2,
                ..Default::default()
            },
            "m".to_string(),
        );

        let result = retrieval
            .retrieve("group:1", "Bob", "remember my pet?", &[])
            .await
            .unwrap();
        assert!(result.contains("miso"));
        // 1 question + 2 capped search rounds.
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn found_false_returns_nothing() {
        let (store, _db) = setup_store().await;
        let llm = Arc::new(StubLlm::with_responses(vec![
            ProviderResponse {
                content: Some("what pet?".to_string()),
                ..Default::default()
            },
            tool_call("found_answer", r#"{"found": false}"#),
        ]));
        let retrieval =
            MemoryRetrieval::new(llm, store, MemoryConfig::default(), "m".to_string());
        assert!(retrieval
            .retrieve("group:1", "Bob", "remember?", &[])
            .await
            .is_none());
    }

    #[tokio::test]
    async fn disabled_is_inert() {
        let (store, _db) = setup_store().await;
        let llm = Arc::new(StubLlm::always_text("should never be called"));
        let retrieval = MemoryRetrieval::new(
            llm.clone(),
            store,
            MemoryConfig {
                enabled: false,
                ..Default::default()
            },
            "m".to_string(),
        );
        assert!(retrieval.retrieve("group:1", "Bob", "hi", &[]).await.is_none());
        assert_eq!(llm.call_count(), 0);
    }
}
