//! Action planner: a cheap LLM pass that decides whether the bot should
//! reply now, hold back, or consider the exchange finished.
//!
//! Purely advisory. The dispatcher acts on the decision; the planner never
//! sends anything itself. Parse failures always degrade to `reply`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{debug, warn};

use super::parse_lenient_json;
use crate::store::MessageRow;
use crate::traits::{ChatOptions, LlmClient};

const DECISION_LOG_CAP: usize = 20;
const HISTORY_WINDOW: usize = 20;
const RECENT_DECISIONS_SHOWN: usize = 5;
const MIN_WAIT_SECS: u64 = 10;
const MAX_WAIT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    Reply,
    Wait,
    Complete,
}

impl PlannedAction {
    fn parse(s: &str) -> Option<PlannedAction> {
        match s {
            "reply" => Some(PlannedAction::Reply),
            "wait" => Some(PlannedAction::Wait),
            "complete" => Some(PlannedAction::Complete),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            PlannedAction::Reply => "reply",
            PlannedAction::Wait => "wait",
            PlannedAction::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlanDecision {
    pub action: PlannedAction,
    pub reason: String,
    pub wait_ms: Option<u64>,
}

impl PlanDecision {
    fn reply(reason: impl Into<String>) -> Self {
        Self {
            action: PlannedAction::Reply,
            reason: reason.into(),
            wait_ms: None,
        }
    }
}

struct DecisionRecord {
    action: PlannedAction,
    reason: String,
}

pub struct ActionPlanner {
    llm: Arc<dyn LlmClient>,
    model: String,
    decisions: Mutex<HashMap<String, VecDeque<DecisionRecord>>>,
}

impl ActionPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, model: String) -> Self {
        Self {
            llm,
            model,
            decisions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn plan(
        &self,
        session_id: &str,
        bot_name: &str,
        history: &[MessageRow],
        trigger_text: &str,
    ) -> PlanDecision {
        let prompt = self.build_prompt(session_id, bot_name, history, trigger_text);
        let messages = vec![json!({"role": "user", "content": prompt})];
        let options = ChatOptions {
            temperature: Some(0.3),
            max_tokens: Some(200),
        };

        let decision = match self.llm.generate_text(&self.model, &messages, &options).await {
            Ok(text) => parse_decision(&text).unwrap_or_else(|| {
                warn!(session_id, "planner output unparseable, defaulting to reply");
                PlanDecision::reply("unparseable planner output")
            }),
            Err(e) => {
                warn!(session_id, error = %e, "planner call failed, defaulting to reply");
                PlanDecision::reply("planner unavailable")
            }
        };

        debug!(
            session_id,
            action = decision.action.as_str(),
            reason = %decision.reason,
            "planner decision"
        );
        self.log_decision(session_id, &decision);
        decision
    }

    fn build_prompt(
        &self,
        session_id: &str,
        bot_name: &str,
        history: &[MessageRow],
        trigger_text: &str,
    ) -> String {
        let mut prompt = format!(
            "你是群聊成员\"{bot_name}\"的决策助手。根据最近的对话判断现在是否适合发言。\n\n"
        );

        let recent: Vec<&MessageRow> = history
            .iter()
            .rev()
            .take(HISTORY_WINDOW)
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

        prompt.push_str(&format!("触发消息: {trigger_text}\n\n"));

        let decisions = self.decisions.lock().unwrap();
        if let Some(log) = decisions.get(session_id) {
            let recent: Vec<String> = log
                .iter()
                .rev()
                .take(RECENT_DECISIONS_SHOWN)
                .map(|d| format!("- {} ({})", d.action.as_str(), d.reason))
                .collect();
            if !recent.is_empty() {
                prompt.push_str("你最近的决定:\n");
                for line in recent.iter().rev() {
                    prompt.push_str(line);
                    prompt.push('\n');
                }
                prompt.push('\n');
            }
        }
        drop(decisions);

        prompt.push_str(
            "只输出 JSON，格式: {\"action\": \"reply\"|\"wait\"|\"complete\", \
             \"reason\": \"简短原因\", \"wait_seconds\": 数字(仅 wait 时)}\n\
             reply=现在回复, wait=先观望一会儿, complete=这轮对话已经结束不用回了。",
        );
        prompt
    }

    fn log_decision(&self, session_id: &str, decision: &PlanDecision) {
        let mut decisions = self.decisions.lock().unwrap();
        let log = decisions.entry(session_id.to_string()).or_default();
        log.push_back(DecisionRecord {
            action: decision.action,
            reason: decision.reason.clone(),
        });
        while log.len() > DECISION_LOG_CAP {
            log.pop_front();
        }
    }

    #[cfg(test)]
    fn decision_count(&self, session_id: &str) -> usize {
        self.decisions
            .lock()
            .unwrap()
            .get(session_id)
            .map_or(0, |log| log.len())
    }
}

fn parse_decision(text: &str) -> Option<PlanDecision> {
    let value = parse_lenient_json(text)?;
    let action = PlannedAction::parse(value.get("action")?.as_str()?)?;
    let reason = value
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let wait_ms = match action {
        PlannedAction::Wait => {
            let secs = value
                .get("wait_seconds")
                .and_then(|v| v.as_u64())
                .unwrap_or(MIN_WAIT_SECS)
                .clamp(MIN_WAIT_SECS, MAX_WAIT_SECS);
            Some(secs * 1000)
        }
        _ => None,
    };
    Some(PlanDecision {
        action,
        reason,
        wait_ms,
    })
}
