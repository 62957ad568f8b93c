//! Self-defense tools: escalate abuse to the bot owners, or apply a short
//! cool-down mute when the bot itself has the power to.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{int_arg, ChatTool, ToolContext};
use crate::traits::Segment;

const AUTO_MUTE_SECONDS: u64 = 60;

pub struct ReportAbuseTool {
    ctx: Arc<ToolContext>,
}

impl ReportAbuseTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChatTool for ReportAbuseTool {
    fn name(&self) -> &str {
        "report_abuse"
    }

    fn description(&self) -> &str {
        "向机器人的主人私聊举报恶意用户"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "integer", "description": "被举报用户 id"},
                "reason": {"type": "string", "description": "举报原因"}
            },
            "required": ["user_id", "reason"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        let user_id = int_arg(args, "user_id")?;
        let reason = args
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("(无说明)");

        let owners = &self.ctx.config.owner_ids;
        if owners.is_empty() {
            anyhow::bail!("no bot owners are configured");
        }

        let location = match self.ctx.group_id {
            Some(group_id) => format!("群 {group_id}"),
            None => "私聊".to_string(),
        };
        let report = format!("[举报] 用户 {user_id}（{location}）: {reason}");

        let mut delivered = 0;
        for owner in owners {
            match self
                .ctx
                .gateway
                .send_private_msg(*owner, &[Segment::text(report.clone())])
                .await
            {
                Ok(_) => delivered += 1,
                Err(e) => warn!(owner, error = %e, "abuse report delivery failed"),
            }
        }
        info!(user_id, delivered, "abuse reported");
        Ok(json!({"reported": true, "delivered": delivered}).to_string())
    }
}

pub struct AutoMuteTool {
    ctx: Arc<ToolContext>,
}

impl AutoMuteTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChatTool for AutoMuteTool {
    fn name(&self) -> &str {
        "auto_mute"
    }

    fn description(&self) -> &str {
        "对刷屏或辱骂的用户自动禁言 60 秒"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "integer", "description": "用户 id"}
            },
            "required": ["user_id"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        let group_id = self.ctx.require_group()?;
        if !self.ctx.bot_role.is_admin() {
            anyhow::bail!("the bot is not a group admin");
        }
        let user_id = int_arg(args, "user_id")?;
        self.ctx
            .gateway
            .set_group_ban(group_id, user_id, AUTO_MUTE_SECONDS)
            .await?;
        info!(group_id, user_id, "auto-muted user for 60s");
        Ok(json!({"success": true, "duration_s": AUTO_MUTE_SECONDS}).to_string())
    }
}
