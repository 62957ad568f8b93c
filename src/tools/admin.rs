//! Group management tools. Only present in the catalog when the group-admin
//! switch is on and the bot itself holds an admin role; the handlers still
//! re-check permissions so a stale catalog can't act.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{int_arg, str_arg, ChatTool, ToolContext};
use crate::traits::GroupRole;

fn require_admin(ctx: &ToolContext) -> anyhow::Result<()> {
    if !ctx.bot_role.is_admin() {
        anyhow::bail!("the bot is not a group admin");
    }
    Ok(())
}

pub struct MuteMemberTool {
    ctx: Arc<ToolContext>,
}

impl MuteMemberTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChatTool for MuteMemberTool {
    fn name(&self) -> &str {
        "mute_member"
    }

    fn description(&self) -> &str {
        "禁言某个群成员一段时间"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "integer", "description": "用户 id"},
                "duration_s": {"type": "integer", "description": "禁言秒数，0 为解除"}
            },
            "required": ["user_id", "duration_s"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        require_admin(&self.ctx)?;
        let group_id = self.ctx.require_group()?;
        let user_id = int_arg(args, "user_id")?;
        let duration_s = int_arg(args, "duration_s")?.max(0) as u64;
        self.ctx
            .gateway
            .set_group_ban(group_id, user_id, duration_s)
            .await?;
        info!(group_id, user_id, duration_s, "muted member");
        Ok(json!({"success": true, "duration_s": duration_s}).to_string())
    }
}

pub struct KickMemberTool {
    ctx: Arc<ToolContext>,
}

impl KickMemberTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChatTool for KickMemberTool {
    fn name(&self) -> &str {
        "kick_member"
    }

    fn description(&self) -> &str {
        "把某个成员移出群聊"
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
        require_admin(&self.ctx)?;
        let group_id = self.ctx.require_group()?;
        let user_id = int_arg(args, "user_id")?;
        self.ctx.gateway.set_group_kick(group_id, user_id).await?;
        info!(group_id, user_id, "kicked member");
        Ok(json!({"success": true}).to_string())
    }
}

pub struct SetMemberCardTool {
    ctx: Arc<ToolContext>,
}

impl SetMemberCardTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChatTool for SetMemberCardTool {
    fn name(&self) -> &str {
        "set_member_card"
    }

    fn description(&self) -> &str {
        "修改某个成员的群名片"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "integer", "description": "用户 id"},
                "card": {"type": "string", "description": "新的群名片，空串清除"}
            },
            "required": ["user_id", "card"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        require_admin(&self.ctx)?;
        let group_id = self.ctx.require_group()?;
        let user_id = int_arg(args, "user_id")?;
        let card = str_arg(args, "card")?;
        self.ctx
            .gateway
            .set_group_card(group_id, user_id, card)
            .await?;
        Ok(json!({"success": true}).to_string())
    }
}

pub struct SetMemberTitleTool {
    ctx: Arc<ToolContext>,
}

impl SetMemberTitleTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChatTool for SetMemberTitleTool {
    fn name(&self) -> &str {
        "set_member_title"
    }

    fn description(&self) -> &str {
        "授予某个成员专属头衔（需要群主身份）"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "user_id": {"type": "integer", "description": "用户 id"},
                "title": {"type": "string", "description": "头衔内容"}
            },
            "required": ["user_id", "title"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        if self.ctx.bot_role != GroupRole::Owner {
            anyhow::bail!("only the group owner can grant titles");
        }
        let group_id = self.ctx.require_group()?;
        let user_id = int_arg(args, "user_id")?;
        let title = str_arg(args, "title")?;
        self.ctx
            .gateway
            .set_group_special_title(group_id, user_id, title)
            .await?;
        Ok(json!({"success": true}).to_string())
    }
}

pub struct ToggleMuteAllTool {
    ctx: Arc<ToolContext>,
}

impl ToggleMuteAllTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChatTool for ToggleMuteAllTool {
    fn name(&self) -> &str {
        "toggle_mute_all"
    }

    fn description(&self) -> &str {
        "开启或关闭全员禁言"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "enable": {"type": "boolean", "description": "true 开启，false 关闭"}
            },
            "required": ["enable"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        require_admin(&self.ctx)?;
        let group_id = self.ctx.require_group()?;
        let enable = args
            .get("enable")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| anyhow::anyhow!("missing required argument 'enable'"))?;
        self.ctx.gateway.set_group_whole_ban(group_id, enable).await?;
        info!(group_id, enable, "toggled whole-group mute");
        Ok(json!({"success": true, "enabled": enable}).to_string())
    }
}
