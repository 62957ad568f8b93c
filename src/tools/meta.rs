//! Skill-loading tools: the model's handle on the session-scoped skill
//! registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{str_arg, ChatTool, ToolContext};

pub struct LoadSkillTool {
    ctx: Arc<ToolContext>,
}

impl LoadSkillTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChatTool for LoadSkillTool {
    fn name(&self) -> &str {
        "load_skill"
    }

    fn description(&self) -> &str {
        "加载一个外部技能，加载后它的工具在本会话可用一小时"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "skill_name": {"type": "string", "description": "技能名"}
            },
            "required": ["skill_name"]
        })
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        let skill_name = str_arg(args, "skill_name")?;
        let count = self
            .ctx
            .skills
            .load_skill(&self.ctx.session_id, skill_name)?;
        Ok(json!({
            "loaded": skill_name,
            "tools": count,
            "note": "工具名带技能前缀，如 skill.tool",
        })
        .to_string())
    }
}

pub struct UnloadSkillTool {
    ctx: Arc<ToolContext>,
}

impl UnloadSkillTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChatTool for UnloadSkillTool {
    fn name(&self) -> &str {
        "unload_skill"
    }

    fn description(&self) -> &str {
        "卸载一个已加载的技能"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "skill_name": {"type": "string", "description": "技能名"}
            },
            "required": ["skill_name"]
        })
    }

    fn return_to_ai(&self) -> bool {
        false
    }

    async fn call(&self, args: &Value) -> anyhow::Result<String> {
        let skill_name = str_arg(args, "skill_name")?;
        let removed = self.ctx.skills.unload_skill(&self.ctx.session_id, skill_name);
        Ok(json!({"unloaded": removed}).to_string())
    }
}
