//! Conversational tools: mentions, quotes, loop termination, pokes.
//!
//! `at_user`, `quote_reply`, and `end_session` are declared here so the
//! model sees them, but their effects are applied inline by the chat engine;
//! their handlers never run.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{int_arg, ChatTool, ToolContext, AT_USER, END_SESSION, QUOTE_REPLY};

pub struct AtUserTool;

#[async_trait]
impl ChatTool for AtUserTool {
    fn name(&self) -> &str {
        AT_USER
    }

    fn description(&self) -> &str {
        "在接下来发出的第一条消息里 @ 某个群成员"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "integer", "description": "要 @ 的用户 id"}
            },
            "required": ["user_id"]
        })
    }

    fn return_to_ai(&self) -> bool {
        false
    }

    async fn call(&self, _args: &Value) -> anyhow::Result<String> {
        // Handled inline by the engine.
        Ok(json!({"queued": true}).to_string())
    }
}

pub struct QuoteReplyTool;

#[async_trait]
impl ChatTool for QuoteReplyTool {
    fn name(&self) -> &str {
        QUOTE_REPLY
    }

    fn description(&self) -> &str {
        "让你的第一条消息引用（回复）某条历史消息"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message_id": {"type": "integer", "description": "被引用消息的 id"}
            },
            "required": ["message_id"]
        })
    }

    fn return_to_ai(&self) -> bool {
        false
    }

    async fn call(&self, _args: &Value) -> anyhow::Result<String> {
        // Handled inline by the engine.
        Ok(json!({"queued": true}).to_string())
    }
}

pub struct EndSessionTool;

#[async_trait]
impl ChatTool for EndSessionTool {
    fn name(&self) -> &str {
        END_SESSION
    }

    fn description(&self) -> &str {
        "这轮不需要回复时调用，立刻结束且不发送任何消息"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": {"type": "string", "description": "简短原因"}
            }
        })
    }

    fn return_to_ai(&self) -> bool {
        false
    }

    async fn call(&self, _args: &Value) -> anyhow::Result<String> {
        // Handled inline by the engine.
        Ok(String::new())
    }
}

pub struct PokeUserTool {
    ctx: Arc<ToolContext>,
}

impl PokeUserTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChatTool for PokeUserTool {
    fn name(&self) -> &str {
        "poke_user"
    }

    fn description(&self) -> &str {
        "戳一戳某个群成员"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "integer", "description": "要戳的用户 id"}
            },
            "required": ["user_id"]
        })
    }

    fn return_to_ai(&self) -> bool {
        false
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        let group_id = self.ctx.require_group()?;
        let user_id = int_arg(args, "user_id")?;
        self.ctx.gateway.group_poke(group_id, user_id).await?;
        Ok(json!({"success": true}).to_string())
    }
}
