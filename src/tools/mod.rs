//! Fixed tool catalog exposed to the chat engine.
//!
//! Tools are constructed per request, bound to a shared `ToolContext` that
//! carries the gateway and the event's scope. Which tools are visible depends
//! on chat kind, config switches, and the bot's own group role.

mod admin;
mod defense;
mod info;
mod meta;
mod social;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::skills::SkillRegistry;
use crate::store::SqliteStore;
use crate::traits::{BotGateway, GroupRole};

pub use admin::{
    KickMemberTool, MuteMemberTool, SetMemberCardTool, SetMemberTitleTool, ToggleMuteAllTool,
};
pub use defense::{AutoMuteTool, ReportAbuseTool};
pub use info::{GetGroupMemberInfoTool, GetGroupMemberListTool};
pub use meta::{LoadSkillTool, UnloadSkillTool};
pub use social::{AtUserTool, EndSessionTool, PokeUserTool, QuoteReplyTool};

/// Tool names the engine handles inline instead of dispatching.
pub const AT_USER: &str = "at_user";
pub const QUOTE_REPLY: &str = "quote_reply";
pub const END_SESSION: &str = "end_session";

/// Request scope every fixed tool is bound to.
pub struct ToolContext {
    pub gateway: Arc<dyn BotGateway>,
    pub store: Arc<SqliteStore>,
    pub skills: Arc<SkillRegistry>,
    pub config: Arc<AppConfig>,
    pub session_id: String,
    pub group_id: Option<i64>,
    pub user_id: i64,
    pub message_id: i64,
    pub bot_role: GroupRole,
}

impl ToolContext {
    pub(crate) fn require_group(&self) -> anyhow::Result<i64> {
        self.group_id
            .ok_or_else(|| anyhow::anyhow!("this tool only works in group chats"))
    }
}

/// A typed callable the model can invoke.
#[async_trait]
pub trait ChatTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON-schema object describing the arguments.
    fn parameters(&self) -> Value;
    /// Whether the result re-enters the model's next turn.
    fn return_to_ai(&self) -> bool {
        true
    }
    async fn call(&self, args: &Value) -> anyhow::Result<String>;
}

/// Build the fixed catalog for one request.
pub fn build_catalog(ctx: &Arc<ToolContext>) -> Vec<Arc<dyn ChatTool>> {
    let cfg = &ctx.config;
    let mut tools: Vec<Arc<dyn ChatTool>> = vec![
        Arc::new(AtUserTool),
        Arc::new(QuoteReplyTool),
        Arc::new(EndSessionTool),
        Arc::new(ReportAbuseTool::new(ctx.clone())),
    ];

    if ctx.group_id.is_some() {
        tools.push(Arc::new(PokeUserTool::new(ctx.clone())));
        tools.push(Arc::new(GetGroupMemberInfoTool::new(ctx.clone())));
        tools.push(Arc::new(GetGroupMemberListTool::new(ctx.clone())));
        if ctx.bot_role.is_admin() {
            tools.push(Arc::new(AutoMuteTool::new(ctx.clone())));
        }
    }

    if ctx.group_id.is_some() && cfg.enable_group_admin && ctx.bot_role.is_admin() {
        tools.push(Arc::new(MuteMemberTool::new(ctx.clone())));
        tools.push(Arc::new(KickMemberTool::new(ctx.clone())));
        tools.push(Arc::new(SetMemberCardTool::new(ctx.clone())));
        tools.push(Arc::new(SetMemberTitleTool::new(ctx.clone())));
        tools.push(Arc::new(ToggleMuteAllTool::new(ctx.clone())));
    }

    if cfg.enable_external_skills {
        tools.push(Arc::new(LoadSkillTool::new(ctx.clone())));
        tools.push(Arc::new(UnloadSkillTool::new(ctx.clone())));
    }

    tools
}

/// Target of an `at_user` call, parsed leniently.
pub fn at_user_target(args: &Value) -> Option<i64> {
    int_arg(args, "user_id").ok()
}

/// Target of a `quote_reply` call, parsed leniently.
pub fn quote_target(args: &Value) -> Option<i64> {
    int_arg(args, "message_id").ok()
}

/// OpenAI-format function definition for one tool.
pub fn tool_definition(name: &str, description: &str, parameters: &Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        }
    })
}

/// Pull an integer argument that models sometimes send as a string.
pub(crate) fn int_arg(args: &Value, key: &str) -> anyhow::Result<i64> {
    match args.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("'{key}' is not an integer")),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("'{key}' is not an integer")),
        _ => anyhow::bail!("missing required argument '{key}'"),
    }
}

pub(crate) fn str_arg<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing required argument '{key}'"))
}
