//! Chat engine: drives the bounded tool-calling loop for one reply.
//!
//! Each iteration rebuilds the system prompt, re-collects the visible tools
//! (fixed catalog + live session skills), and feeds every tool result back
//! under its tool_call id. The loop ends when the model stops calling tools,
//! when nothing it called returns to the prompt, or at the iteration cap.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::humanizer::EmojiSystem;
use crate::prompt::{build_system_prompt, PromptContext};
use crate::store::{NewMessage, SqliteStore};
use crate::tools::{self, build_catalog, ChatTool, ToolContext};
use crate::traits::{ChatOptions, LlmClient};

#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: Value,
    pub result: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct ChatOutcome {
    /// Outbound messages, already split on `---` separators.
    pub messages: Vec<String>,
    /// Users to @-mention on the first outbound message.
    pub pending_ats: Vec<i64>,
    /// Message to quote on the first outbound message.
    pub pending_quote: Option<i64>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub emoji_path: Option<PathBuf>,
}

pub struct ChatEngine {
    llm: Arc<dyn LlmClient>,
    store: Arc<SqliteStore>,
    emoji: Arc<EmojiSystem>,
    config: Arc<AppConfig>,
}

impl ChatEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<SqliteStore>,
        emoji: Arc<EmojiSystem>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            llm,
            store,
            emoji,
            config,
        }
    }

    pub async fn run_chat(
        &self,
        mut prompt_ctx: PromptContext,
        tool_ctx: Arc<ToolContext>,
    ) -> anyhow::Result<ChatOutcome> {
        let catalog = build_catalog(&tool_ctx);
        let cap = self.config.iteration_cap().max(1);
        let options = ChatOptions {
            temperature: Some(self.config.temperature),
            max_tokens: None,
        };

        let target_line = format!(
            "{}: {}",
            prompt_ctx.target.user_name, prompt_ctx.target.text
        );

        let mut pending_ats: Vec<i64> = Vec::new();
        let mut pending_quote: Option<i64> = None;
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut tool_results_for_next: Vec<String> = Vec::new();
        // Assistant turns and their tool results, appended across iterations
        // so every tool_call id is answered on the wire.
        let mut wire_tail: Vec<Value> = Vec::new();
        let mut last_text = String::new();

        for iteration in 0..cap {
            prompt_ctx.iteration = iteration;
            prompt_ctx.tool_results = tool_results_for_next.clone();
            prompt_ctx.loaded_skills = tool_ctx.skills.loaded_skills(&tool_ctx.session_id);

            let system = build_system_prompt(&prompt_ctx);
            let mut messages = vec![
                json!({"role": "system", "content": system}),
                json!({"role": "user", "content": target_line.clone()}),
            ];
            messages.extend(wire_tail.iter().cloned());

            let skill_tools = tool_ctx.skills.get_tools(&tool_ctx.session_id);
            let mut defs: Vec<Value> = catalog
                .iter()
                .map(|t| tools::tool_definition(t.name(), t.description(), &t.parameters()))
                .collect();
            for (fq_name, tool) in &skill_tools {
                defs.push(tools::tool_definition(
                    fq_name,
                    &tool.description,
                    &tool.parameters,
                ));
            }

            let response = self
                .llm
                .complete(&self.config.model, &messages, &defs, &options)
                .await?;

            if let Some(reasoning) = &response.reasoning {
                debug!(session_id = %tool_ctx.session_id, iteration, reasoning = %reasoning, "model reasoning");
            }
            if let Some(content) = &response.content {
                if !content.trim().is_empty() {
                    last_text = content.clone();
                }
            }
            if response.tool_calls.is_empty() {
                break;
            }

            info!(
                session_id = %tool_ctx.session_id,
                iteration,
                calls = response.tool_calls.len(),
                "tool round"
            );

            wire_tail.push(json!({
                "role": "assistant",
                "content": response.content,
                "tool_calls": response.tool_calls.iter().map(|tc| json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {"name": tc.name, "arguments": tc.arguments},
                })).collect::<Vec<_>>(),
            }));

            tool_results_for_next.clear();
            let mut any_returning = false;

            for call in &response.tool_calls {
                let args: Value =
                    serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));

                let payload = match call.name.as_str() {
                    tools::AT_USER => {
                        let result = tools::at_user_target(&args);
                        if let Some(user_id) = result {
                            pending_ats.push(user_id);
                        }
                        records.push(ToolCallRecord {
                            name: call.name.clone(),
                            arguments: args.clone(),
                            result: Some("queued".to_string()),
                            error: None,
                        });
                        json!({"success": result.is_some()}).to_string()
                    }
                    tools::QUOTE_REPLY => {
                        let result = tools::quote_target(&args);
                        if let Some(message_id) = result {
                            pending_quote = Some(message_id);
                        }
                        records.push(ToolCallRecord {
                            name: call.name.clone(),
                            arguments: args.clone(),
                            result: Some("queued".to_string()),
                            error: None,
                        });
                        json!({"success": result.is_some()}).to_string()
                    }
                    tools::END_SESSION => {
                        let reason = args
                            .get("reason")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default();
                        info!(session_id = %tool_ctx.session_id, reason, "model ended session");
                        records.push(ToolCallRecord {
                            name: call.name.clone(),
                            arguments: args,
                            result: Some("ended".to_string()),
                            error: None,
                        });
                        return Ok(ChatOutcome {
                            tool_calls: records,
                            ..Default::default()
                        });
                    }
                    name => {
                        let (payload, returning) = self
                            .dispatch(name, &args, &catalog, &skill_tools, &mut records)
                            .await;
                        if returning {
                            any_returning = true;
                            tool_results_for_next.push(format!("{name}: {payload}"));
                        }
                        payload
                    }
                };

                wire_tail.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": payload,
                }));
            }

            if !any_returning {
                break;
            }
        }

        let outbound = split_reply(&last_text);

        if !last_text.trim().is_empty() {
            self.store
                .save_message(&NewMessage {
                    session_id: tool_ctx.session_id.clone(),
                    role: "assistant".to_string(),
                    content: last_text.clone(),
                    group_id: tool_ctx.group_id,
                    ..Default::default()
                })
                .await?;
        }

        let emoji_path = if outbound.is_empty() {
            None
        } else {
            self.emoji.pick_emoji(&last_text).await
        };

        Ok(ChatOutcome {
            messages: outbound,
            pending_ats,
            pending_quote,
            tool_calls: records,
            emoji_path,
        })
    }

    /// Run one catalog or skill tool. Returns the wire payload and whether
    /// it feeds the next prompt.
    async fn dispatch(
        &self,
        name: &str,
        args: &Value,
        catalog: &[Arc<dyn ChatTool>],
        skill_tools: &[(String, crate::skills::SkillTool)],
        records: &mut Vec<ToolCallRecord>,
    ) -> (String, bool) {
        if let Some(tool) = catalog.iter().find(|t| t.name() == name) {
            return match tool.call(args).await {
                Ok(result) => {
                    records.push(ToolCallRecord {
                        name: name.to_string(),
                        arguments: args.clone(),
                        result: Some(result.clone()),
                        error: None,
                    });
                    (result, tool.return_to_ai())
                }
                Err(e) => {
                    warn!(tool = name, error = %e, "tool call failed");
                    let payload = json!({"error": e.to_string()}).to_string();
                    records.push(ToolCallRecord {
                        name: name.to_string(),
                        arguments: args.clone(),
                        result: None,
                        error: Some(e.to_string()),
                    });
                    (payload, tool.return_to_ai())
                }
            };
        }

        if let Some((_, tool)) = skill_tools.iter().find(|(fq, _)| fq == name) {
            return match tool.handler.call(args).await {
                Ok(result) => {
                    records.push(ToolCallRecord {
                        name: name.to_string(),
                        arguments: args.clone(),
                        result: Some(result.clone()),
                        error: None,
                    });
                    (result, tool.return_to_ai)
                }
                Err(e) => {
                    warn!(tool = name, error = %e, "skill tool call failed");
                    let payload = json!({"error": e.to_string()}).to_string();
                    records.push(ToolCallRecord {
                        name: name.to_string(),
                        arguments: args.clone(),
                        result: None,
                        error: Some(e.to_string()),
                    });
                    (payload, tool.return_to_ai)
                }
            };
        }

        warn!(tool = name, "model called unknown tool");
        let payload = json!({"error": format!("unknown tool '{name}'")}).to_string();
        records.push(ToolCallRecord {
            name: name.to_string(),
            arguments: args.clone(),
            result: None,
            error: Some("unknown tool".to_string()),
        });
        // Feed the error back so the model can correct itself.
        (payload, true)
    }
}

/// Split the model's final text into separate outbound messages on lines
/// consisting solely of `---`.
fn split_reply(text: &str) -> Vec<String> {
    let mut messages = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim() == "---" {
            messages.push(current.join("\n"));
            current.clear();
        } else {
            current.push(line);
        }
    }
    messages.push(current.join("\n"));

    messages
        .into_iter()
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{ChatKind, TargetMessage};
    use crate::skills::SkillRegistry;
    use crate::testing::{temp_store, test_config, RecordingGateway, StubLlm};
    use crate::traits::{GroupRole, ProviderResponse, ToolCall};
    use chrono::Local;

    struct Fixture {
        engine: ChatEngine,
        llm: Arc<StubLlm>,
        gateway: Arc<RecordingGateway>,
        store: Arc<SqliteStore>,
        skills: Arc<SkillRegistry>,
        config: Arc<AppConfig>,
        _db: tempfile::NamedTempFile,
    }

    async fn fixture(llm: StubLlm) -> Fixture {
        fixture_with_config(llm, test_config()).await
    }

    async fn fixture_with_config(llm: StubLlm, config: AppConfig) -> Fixture {
        let (store, db) = temp_store().await;
        let llm = Arc::new(llm);
        let gateway = Arc::new(RecordingGateway::new());
        let skills = Arc::new(SkillRegistry::new());
        let config = Arc::new(config);
        let emoji = Arc::new(EmojiSystem::new(
            llm.clone(),
            store.clone(),
            config.emoji.clone(),
            config.working_model().to_string(),
            config.is_multimodal,
        ));
        let engine = ChatEngine::new(llm.clone(), store.clone(), emoji, config.clone());
        Fixture {
            engine,
            llm,
            gateway,
            store,
            skills,
            config,
            _db: db,
        }
    }

    fn tool_ctx(f: &Fixture) -> Arc<ToolContext> {
        Arc::new(ToolContext {
            gateway: f.gateway.clone(),
            store: f.store.clone(),
            skills: f.skills.clone(),
            config: f.config.clone(),
            session_id: "group:100".to_string(),
            group_id: Some(100),
            user_id: 42,
            message_id: 900,
            bot_role: GroupRole::Member,
        })
    }

    fn prompt_ctx() -> PromptContext {
        PromptContext {
            bot_name: "miku".to_string(),
            persona: "friendly".to_string(),
            personality_state: None,
            reply_style: "casual".to_string(),
            now: Local::now(),
            chat_kind: ChatKind::Group,
            group: None,
            history: vec![],
            target: TargetMessage {
                user_id: 42,
                user_name: "Bob".to_string(),
                user_role: Some("member".to_string()),
                user_title: None,
                message_id: 900,
                text: "hi".to_string(),
            },
            planner_reason: None,
            memory_context: None,
            topic_context: None,
            expression_context: None,
            tool_results: vec![],
            iteration: 0,
            loaded_skills: vec![],
            external_skills: vec![],
            enable_external_skills: false,
            admin_tools_enabled: false,
            can_mute: false,
        }
    }

    fn calls(entries: &[(&str, &str)]) -> ProviderResponse {
        ProviderResponse {
            content: None,
            tool_calls: entries
                .iter()
                .enumerate()
                .map(|(i, (name, args))| ToolCall {
                    id: format!("call-{i}"),
                    name: name.to_string(),
                    arguments: args.to_string(),
                })
                .collect(),
            reasoning: None,
        }
    }

    fn text(content: &str) -> ProviderResponse {
        ProviderResponse {
            content: Some(content.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn reply_splits_on_separator_lines() {
        assert_eq!(
            split_reply("hey\n---\nhow's it going?"),
            vec!["hey", "how's it going?"]
        );
        assert_eq!(split_reply("one message"), vec!["one message"]);
        assert_eq!(split_reply("a\n --- \nb\n---\n"), vec!["a", "b"]);
        assert!(split_reply("").is_empty());
        // A dash run inside a line is not a separator.
        assert_eq!(split_reply("a --- b"), vec!["a --- b"]);
    }

    #[tokio::test]
    async fn plain_text_response_ends_after_one_call() {
        let f = fixture(StubLlm::with_responses(vec![text("hey\n---\nhow's it going?")])).await;
        let outcome = f.engine.run_chat(prompt_ctx(), tool_ctx(&f)).await.unwrap();

        assert_eq!(outcome.messages, vec!["hey", "how's it going?"]);
        assert_eq!(f.llm.call_count(), 1);
        // Raw text persisted as one assistant row.
        let rows = f.store.get_messages("group:100", 10, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].role, "assistant");
        assert_eq!(rows[0].content, "hey\n---\nhow's it going?");
    }

    #[tokio::test]
    async fn at_and_info_tools_then_text() {
        let f = fixture(StubLlm::with_responses(vec![
            calls(&[
                ("at_user", r#"{"user_id": 42}"#),
                ("get_group_member_info", r#"{"user_id": 42}"#),
            ]),
            text("ok Bob\n"),
        ]))
        .await;
        let outcome = f.engine.run_chat(prompt_ctx(), tool_ctx(&f)).await.unwrap();

        assert_eq!(f.llm.call_count(), 2);
        assert_eq!(outcome.pending_ats, vec![42]);
        assert_eq!(outcome.messages, vec!["ok Bob"]);

        // The second call answered both tool_call ids exactly once.
        let second = &f.llm.calls()[1];
        let tool_messages: Vec<&Value> = second
            .messages
            .iter()
            .filter(|m| m["role"] == "tool")
            .collect();
        assert_eq!(tool_messages.len(), 2);
        let ids: Vec<&str> = tool_messages
            .iter()
            .map(|m| m["tool_call_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["call-0", "call-1"]);

        // And the tool results section appears in the rebuilt system prompt.
        let system = second.messages[0]["content"].as_str().unwrap();
        assert!(system.contains("工具调用结果"));
        assert!(system.contains("get_group_member_info"));
    }

    #[tokio::test]
    async fn only_non_returning_tools_break_the_loop() {
        let f = fixture(StubLlm::with_responses(vec![ProviderResponse {
            content: Some("later!".to_string()),
            tool_calls: vec![ToolCall {
                id: "call-0".to_string(),
                name: "at_user".to_string(),
                arguments: r#"{"user_id": 7}"#.to_string(),
            }],
            reasoning: None,
        }]))
        .await;
        let outcome = f.engine.run_chat(prompt_ctx(), tool_ctx(&f)).await.unwrap();

        // at_user does not return to the model, so one LLM round suffices.
        assert_eq!(f.llm.call_count(), 1);
        assert_eq!(outcome.pending_ats, vec![7]);
        assert_eq!(outcome.messages, vec!["later!"]);
    }

    #[tokio::test]
    async fn end_session_suppresses_output() {
        let f = fixture(StubLlm::with_responses(vec![calls(&[(
            "end_session",
            r#"{"reason": "nothing to add"}"#,
        )])]))
        .await;
        let outcome = f.engine.run_chat(prompt_ctx(), tool_ctx(&f)).await.unwrap();

        assert!(outcome.messages.is_empty());
        assert!(outcome.emoji_path.is_none());
        // No assistant row is persisted when the session ends silently.
        let rows = f.store.get_messages("group:100", 10, None).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_error_is_fed_back() {
        let f = fixture(StubLlm::with_responses(vec![
            calls(&[("teleport", r#"{}"#)]),
            text("nevermind"),
        ]))
        .await;
        let outcome = f.engine.run_chat(prompt_ctx(), tool_ctx(&f)).await.unwrap();

        assert_eq!(outcome.messages, vec!["nevermind"]);
        let second = &f.llm.calls()[1];
        let tool_message = second
            .messages
            .iter()
            .find(|m| m["role"] == "tool")
            .unwrap();
        assert!(tool_message["content"]
            .as_str()
            .unwrap()
            .contains("unknown tool"));
    }

    #[tokio::test]
    async fn handler_error_is_reported_not_fatal() {
        // report_abuse fails without configured owners.
        let f = fixture(StubLlm::with_responses(vec![
            calls(&[("report_abuse", r#"{"user_id": 1, "reason": "spam"}"#)]),
            text("done"),
        ]))
        .await;
        // No owners configured: the handler fails.
        let outcome = f.engine.run_chat(prompt_ctx(), tool_ctx(&f)).await.unwrap();

        assert_eq!(outcome.messages, vec!["done"]);
        let record = &outcome.tool_calls[0];
        assert_eq!(record.name, "report_abuse");
        assert!(record.error.as_deref().unwrap().contains("owner"));
    }

    #[tokio::test]
    async fn iteration_cap_stops_a_looping_model() {
        let mut cfg = test_config();
        cfg.max_iterations = 3;
        let f = fixture_with_config(
            StubLlm::with_responses(vec![
                calls(&[("get_group_member_info", r#"{"user_id": 1}"#)]),
                calls(&[("get_group_member_info", r#"{"user_id": 2}"#)]),
                calls(&[("get_group_member_info", r#"{"user_id": 3}"#)]),
                calls(&[("get_group_member_info", r#"{"user_id": 4}"#)]),
            ]),
            cfg,
        )
        .await;
        f.engine.run_chat(prompt_ctx(), tool_ctx(&f)).await.unwrap();
        assert_eq!(f.llm.call_count(), 3);
    }

    #[tokio::test]
    async fn session_skill_tools_are_callable() {
        use crate::skills::{Skill, SkillHandler, SkillTool};
        use async_trait::async_trait;

        struct Weather;
        #[async_trait]
        impl SkillHandler for Weather {
            async fn call(&self, _args: &Value) -> anyhow::Result<String> {
                Ok("sunny".to_string())
            }
        }

        let f = fixture(StubLlm::with_responses(vec![
            calls(&[("weather.current", r#"{"city": "sh"}"#)]),
            text("sunny today"),
        ]))
        .await;
        f.skills.register(Skill {
            name: "weather".to_string(),
            description: "weather".to_string(),
            tools: vec![SkillTool {
                name: "current".to_string(),
                description: "current".to_string(),
                parameters: json!({"type": "object", "properties": {}}),
                return_to_ai: true,
                handler: Arc::new(Weather),
            }],
        });
        f.skills.load_skill("group:100", "weather").unwrap();

        let outcome = f.engine.run_chat(prompt_ctx(), tool_ctx(&f)).await.unwrap();
        assert_eq!(outcome.messages, vec!["sunny today"]);
        assert_eq!(outcome.tool_calls[0].result.as_deref(), Some("sunny"));

        // The skill tool was offered to the model under its namespaced name.
        let first = &f.llm.calls()[0];
        assert!(first.tools.iter().any(|d| {
            d["function"]["name"] == "weather.current"
        }));
    }
}
