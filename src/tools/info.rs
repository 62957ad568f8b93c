//! Read-only group information tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{int_arg, ChatTool, ToolContext};

const MEMBER_LIST_LIMIT: usize = 50;

pub struct GetGroupMemberInfoTool {
    ctx: Arc<ToolContext>,
}

impl GetGroupMemberInfoTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChatTool for GetGroupMemberInfoTool {
    fn name(&self) -> &str {
        "get_group_member_info"
    }

    fn description(&self) -> &str {
        "查询某个群成员的资料（昵称、群名片、身份、头衔）"
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
        let user_id = int_arg(args, "user_id")?;
        let member = self
            .ctx
            .gateway
            .get_group_member_info(group_id, user_id)
            .await?;
        Ok(json!({
            "user_id": member.user_id,
            "nickname": member.nickname,
            "card": member.card,
            "role": member.role.as_str(),
            "title": member.title,
        })
        .to_string())
    }
}

pub struct GetGroupMemberListTool {
    ctx: Arc<ToolContext>,
}

impl GetGroupMemberListTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChatTool for GetGroupMemberListTool {
    fn name(&self) -> &str {
        "get_group_member_list"
    }

    fn description(&self) -> &str {
        "获取群成员列表（最多前 50 个）"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn call(&self, _args: &Value) -> anyhow::Result<String> {
        let group_id = self.ctx.require_group()?;
        let members = self.ctx.gateway.get_group_member_list(group_id).await?;
        let total = members.len();
        let listed: Vec<Value> = members
            .iter()
            .take(MEMBER_LIST_LIMIT)
            .map(|m| {
                json!({
                    "user_id": m.user_id,
                    "name": m.display_name(),
                    "role": m.role.as_str(),
                })
            })
            .collect();
        Ok(json!({"total": total, "members": listed}).to_string())
    }
}
