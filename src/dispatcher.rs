//! Event dispatcher: the front door for every inbound gateway event.
//!
//! Decides whether a message triggers the bot (direct @, nickname,
//! quote-of-bot, follow-up window), applies the rate limiter, and drives
//! `process_chat`: persist, fan out to the humanizer analyzers, consult the
//! planner, run the chat engine, and emit the reply with human pacing.
//!
//! At most one `process_chat` runs per session at a time; concurrent
//! arrivals for the same session are dropped, not queued.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::engine::ChatEngine;
use crate::humanizer::{
    humanize_typos, ActionPlanner, EmojiSystem, ExpressionLearner, FrequencyController,
    MemoryRetrieval, PlannedAction, TopicTracker,
};
use crate::prompt::{
    pick_personality_state, pick_reply_style, ChatKind, GroupMeta, PromptContext, TargetMessage,
};
use crate::rate_limit::RateLimiter;
use crate::session::SessionManager;
use crate::skills::SkillRegistry;
use crate::store::{
    group_session_id, personal_session_id, NewMessage, SessionKind, SqliteStore,
};
use crate::tools::ToolContext;
use crate::traits::{
    BotEvent, BotGateway, GroupRole, LlmClient, MessageEvent, PokeEvent, Segment, Sender,
};

/// How long after a bot reply a user can follow up without re-addressing it.
pub const FOLLOW_UP_WINDOW_MS: u64 = 3 * 60 * 1000;

const POKE_COOLDOWN_MS: u64 = 10 * 60 * 1000;
const SEND_PACING: Duration = Duration::from_millis(300);
const PROCESS_HISTORY_LIMIT: u32 = 30;
const QUOTE_EXCERPT_CHARS: usize = 50;

#[derive(Debug, Clone, Default)]
struct ProcessOptions {
    skip_planner: bool,
    trigger_reason: Option<String>,
}

pub struct Dispatcher {
    config: Arc<AppConfig>,
    store: Arc<SqliteStore>,
    gateway: Arc<dyn BotGateway>,
    sessions: SessionManager,
    rate: Arc<RateLimiter>,
    skills: Arc<SkillRegistry>,
    engine: ChatEngine,
    memory: MemoryRetrieval,
    topics: Arc<TopicTracker>,
    planner: ActionPlanner,
    expressions: Arc<ExpressionLearner>,
    emoji: Arc<EmojiSystem>,
    frequency: FrequencyController,
    in_flight: Arc<Mutex<HashSet<String>>>,
    recent_replies: Mutex<HashMap<(i64, i64), DateTime<Utc>>>,
    poke_cooldowns: Mutex<HashMap<i64, DateTime<Utc>>>,
}

/// Removes its session id from the in-flight set when dropped, so a panic or
/// early return can never wedge a session.
pub(crate) struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, id: &str) -> Option<InFlightGuard> {
        let mut guard = set.lock().unwrap();
        if !guard.insert(id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(set),
            id: id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.id);
    }
}

impl Dispatcher {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<SqliteStore>,
        gateway: Arc<dyn BotGateway>,
        llm: Arc<dyn LlmClient>,
        skills: Arc<SkillRegistry>,
        rate: Arc<RateLimiter>,
        emoji: Arc<EmojiSystem>,
    ) -> Arc<Self> {
        let working_model = config.working_model().to_string();
        let sessions = SessionManager::new(store.clone(), config.max_sessions);
        let engine = ChatEngine::new(llm.clone(), store.clone(), emoji.clone(), config.clone());
        let memory = MemoryRetrieval::new(
            llm.clone(),
            store.clone(),
            config.memory.clone(),
            working_model.clone(),
        );
        let topics = Arc::new(TopicTracker::new(
            llm.clone(),
            store.clone(),
            config.topic.clone(),
            working_model.clone(),
        ));
        let planner = ActionPlanner::new(llm.clone(), working_model.clone());
        let expressions = Arc::new(ExpressionLearner::new(
            llm,
            store.clone(),
            config.expression.clone(),
            working_model,
        ));
        let frequency = FrequencyController::new(config.frequency.clone());

        Arc::new(Self {
            config,
            store,
            gateway,
            sessions,
            rate,
            skills,
            engine,
            memory,
            topics,
            planner,
            expressions,
            emoji,
            frequency,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            recent_replies: Mutex::new(HashMap::new()),
            poke_cooldowns: Mutex::new(HashMap::new()),
        })
    }

    /// Consume gateway events forever; each event gets its own task.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<BotEvent>) {
        while let Some(event) = events.recv().await {
            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                match event {
                    BotEvent::Message(ev) => dispatcher.on_message(ev).await,
                    BotEvent::Poke(ev) => dispatcher.on_poke(ev).await,
                }
            });
        }
        info!("event channel closed, dispatcher stopping");
    }

    pub async fn on_message(&self, ev: MessageEvent) {
        if ev.user_id == ev.self_id {
            return;
        }

        let text = ev.plain_text();

        if self.handle_command(&ev, &text).await {
            return;
        }

        if let Some(group_id) = ev.group_id {
            if !self.config.group_allowed(group_id) {
                return;
            }
        }

        let options = match self.decide_trigger(&ev, &text).await {
            Some(options) => options,
            None => return,
        };

        if !self.rate.check(ev.user_id, ev.group_id, &text) {
            debug!(user_id = ev.user_id, "rate limited, dropping");
            return;
        }
        self.rate.record(ev.user_id, ev.group_id, &text);

        self.process_chat(&ev, options).await;
    }

    /// Returns trigger options when the bot should engage, `None` to stay
    /// silent.
    async fn decide_trigger(&self, ev: &MessageEvent, text: &str) -> Option<ProcessOptions> {
        // Private chats always engage.
        let Some(group_id) = ev.group_id else {
            return Some(ProcessOptions::default());
        };

        if ev.mentions_bot() {
            return Some(ProcessOptions {
                trigger_reason: Some("被 @ 了".to_string()),
                ..Default::default()
            });
        }

        let lower = text.to_lowercase();
        if self
            .config
            .nicknames
            .iter()
            .any(|n| !n.is_empty() && lower.contains(&n.to_lowercase()))
        {
            return Some(ProcessOptions {
                trigger_reason: Some("有人喊你的名字".to_string()),
                ..Default::default()
            });
        }

        if let Some(quoted_id) = ev.quoted_message_id() {
            if let Ok(quoted) = self.gateway.get_msg(quoted_id).await {
                if quoted.sender.user_id == ev.self_id {
                    return Some(ProcessOptions {
                        trigger_reason: Some("有人回复了你的消息".to_string()),
                        ..Default::default()
                    });
                }
            }
        }

        // Follow-up window: the record is consumed before the planner runs;
        // stale records are dropped on the way out.
        let within_window = {
            let mut replies = self.recent_replies.lock().unwrap();
            match replies.remove(&(group_id, ev.user_id)) {
                Some(last) => {
                    ((Utc::now() - last).num_milliseconds().max(0) as u64) < FOLLOW_UP_WINDOW_MS
                }
                None => false,
            }
        };
        if !within_window {
            return None;
        }

        let session_id = group_session_id(group_id);
        let history = self
            .store
            .get_messages(&session_id, PROCESS_HISTORY_LIMIT, None)
            .await
            .unwrap_or_default();
        let decision = self
            .planner
            .plan(&session_id, &self.bot_name(), &history, text)
            .await;
        match decision.action {
            PlannedAction::Reply => Some(ProcessOptions {
                skip_planner: true,
                trigger_reason: Some(decision.reason),
            }),
            PlannedAction::Wait | PlannedAction::Complete => {
                debug!(group_id, user_id = ev.user_id, "planner declined follow-up");
                None
            }
        }
    }

    /// `/reset-self` and `/reset-group`. Returns true when the message was a
    /// command (handled or refused).
    async fn handle_command(&self, ev: &MessageEvent, text: &str) -> bool {
        match text.trim() {
            "/reset-self" => {
                let session_id = personal_session_id(ev.user_id);
                let result = self.sessions.reset(&session_id).await;
                let reply = match result {
                    Ok(()) => "你的个人会话已重置",
                    Err(ref e) => {
                        warn!(error = %e, "reset-self failed");
                        "重置失败，稍后再试"
                    }
                };
                self.reply_text(ev, reply).await;
                true
            }
            "/reset-group" => {
                let Some(group_id) = ev.group_id else {
                    self.reply_text(ev, "这个命令只在群里有用").await;
                    return true;
                };
                let allowed = ev.sender.role.is_admin()
                    || self.config.owner_ids.contains(&ev.user_id);
                if !allowed {
                    self.reply_text(ev, "需要管理员才能重置群会话").await;
                    return true;
                }
                let session_id = group_session_id(group_id);
                let reply = match self.sessions.reset(&session_id).await {
                    Ok(()) => "群会话已重置",
                    Err(ref e) => {
                        warn!(error = %e, "reset-group failed");
                        "重置失败，稍后再试"
                    }
                };
                self.reply_text(ev, reply).await;
                true
            }
            _ => false,
        }
    }

    async fn reply_text(&self, ev: &MessageEvent, text: &str) {
        let segments = [Segment::text(text)];
        let result = match ev.group_id {
            Some(group_id) => self.gateway.send_group_msg(group_id, &segments).await,
            None => self.gateway.send_private_msg(ev.user_id, &segments).await,
        };
        if let Err(e) = result {
            warn!(error = %e, "command reply failed");
        }
    }

    pub async fn on_poke(&self, ev: PokeEvent) {
        if ev.target_id != ev.self_id {
            return;
        }
        if !self.config.group_allowed(ev.group_id) {
            return;
        }

        {
            let mut cooldowns = self.poke_cooldowns.lock().unwrap();
            let now = Utc::now();
            if let Some(last) = cooldowns.get(&ev.group_id) {
                if ((now - *last).num_milliseconds().max(0) as u64) < POKE_COOLDOWN_MS {
                    return;
                }
            }
            cooldowns.insert(ev.group_id, now);
        }

        let sender = match self
            .gateway
            .get_group_member_info(ev.group_id, ev.user_id)
            .await
        {
            Ok(member) => Sender {
                user_id: member.user_id,
                nickname: member.nickname,
                card: member.card,
                role: member.role,
                title: member.title,
            },
            Err(e) => {
                warn!(error = %e, "poke sender lookup failed");
                Sender {
                    user_id: ev.user_id,
                    nickname: ev.user_id.to_string(),
                    ..Default::default()
                }
            }
        };

        let name = sender.display_name().to_string();
        let synthetic = MessageEvent {
            message_id: 0,
            self_id: ev.self_id,
            group_id: Some(ev.group_id),
            user_id: ev.user_id,
            sender,
            segments: vec![Segment::text(format!("[{name} 戳了戳你]"))],
            time: Utc::now().timestamp(),
        };

        self.process_chat(
            &synthetic,
            ProcessOptions {
                skip_planner: false,
                trigger_reason: Some("被戳了一下".to_string()),
            },
        )
        .await;
    }

    async fn process_chat(&self, ev: &MessageEvent, options: ProcessOptions) {
        let session_id = match ev.group_id {
            Some(group_id) => group_session_id(group_id),
            None => personal_session_id(ev.user_id),
        };

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &session_id) else {
            debug!(session_id = %session_id, "already in flight, dropping");
            return;
        };

        if let Err(e) = self.process_chat_inner(ev, &session_id, options).await {
            warn!(session_id = %session_id, error = %e, "process_chat failed");
        }
    }

    async fn process_chat_inner(
        &self,
        ev: &MessageEvent,
        session_id: &str,
        options: ProcessOptions,
    ) -> anyhow::Result<()> {
        let is_group = ev.group_id.is_some();
        match ev.group_id {
            Some(group_id) => {
                self.sessions
                    .get_or_create(session_id, SessionKind::Group, group_id)
                    .await?;
            }
            None => {
                self.sessions
                    .get_or_create(session_id, SessionKind::Personal, ev.user_id)
                    .await?;
            }
        }

        let (mut persisted_content, display_text) = extract_content(&ev.segments);

        if let Some(quoted_id) = ev.quoted_message_id() {
            if let Ok(quoted) = self.gateway.get_msg(quoted_id).await {
                if quoted.sender.user_id != ev.self_id {
                    let excerpt: String = crate::traits::plain_text(&quoted.segments)
                        .chars()
                        .take(QUOTE_EXCERPT_CHARS)
                        .collect();
                    persisted_content = format!(
                        "[引用 {}: \"{}\"] {}",
                        quoted.sender.display_name(),
                        excerpt,
                        persisted_content
                    );
                }
            }
        }

        let inbound = NewMessage {
            session_id: session_id.to_string(),
            role: "user".to_string(),
            content: persisted_content.clone(),
            user_id: Some(ev.user_id),
            user_name: Some(ev.sender.display_name().to_string()),
            user_role: Some(ev.sender.role.as_str().to_string()),
            user_title: ev.sender.title.clone(),
            group_id: ev.group_id,
            group_name: None,
            message_id: Some(ev.message_id).filter(|id| *id != 0),
        };
        self.store.save_message(&inbound).await?;
        if is_group {
            // Second copy under the sender's personal session enables
            // cross-group lookups.
            let personal = personal_session_id(ev.user_id);
            self.sessions
                .get_or_create(&personal, SessionKind::Personal, ev.user_id)
                .await?;
            self.store
                .save_message(&NewMessage {
                    session_id: personal,
                    ..inbound.clone()
                })
                .await?;
        }

        self.expressions.on_message(
            session_id,
            ev.user_id,
            ev.sender.display_name(),
            &display_text,
        );
        self.topics.on_message(session_id);
        self.emoji.collect_from_segments(&ev.segments);

        if is_group && !self.frequency.should_speak(session_id) {
            debug!(session_id, "frequency controller says stay quiet");
            return Ok(());
        }

        let history = self
            .store
            .get_messages(session_id, PROCESS_HISTORY_LIMIT, None)
            .await?;

        let mut planner_reason = options.trigger_reason;
        if !options.skip_planner && self.config.planner.enabled {
            let decision = self
                .planner
                .plan(session_id, &self.bot_name(), &history, &display_text)
                .await;
            match decision.action {
                PlannedAction::Complete => {
                    debug!(session_id, "planner: conversation complete");
                    return Ok(());
                }
                PlannedAction::Wait => {
                    debug!(session_id, wait_ms = ?decision.wait_ms, "planner: waiting");
                    return Ok(());
                }
                PlannedAction::Reply => planner_reason = Some(decision.reason),
            }
        }

        let (group_meta, bot_role) = match ev.group_id {
            Some(group_id) => {
                let info = self.gateway.get_group_info(group_id).await.ok();
                let me = self
                    .gateway
                    .get_group_member_info(group_id, ev.self_id)
                    .await
                    .ok();
                let role = me.as_ref().map(|m| m.role).unwrap_or_default();
                (
                    info.map(|i| GroupMeta {
                        name: i.group_name,
                        member_count: i.member_count,
                        bot_role: role,
                    }),
                    role,
                )
            }
            None => (None, GroupRole::Member),
        };

        let memory_context = self
            .memory
            .retrieve(
                session_id,
                ev.sender.display_name(),
                &display_text,
                &history,
            )
            .await;
        let topic_context = self.topics.topic_context(session_id).await;
        let expression_context = self.expressions.expression_context(session_id).await;

        let admin_tools_enabled =
            is_group && self.config.enable_group_admin && bot_role.is_admin();
        let prompt_ctx = PromptContext {
            bot_name: self.bot_name(),
            persona: self.config.persona.clone(),
            personality_state: pick_personality_state(&self.config.personality),
            reply_style: pick_reply_style(&self.config.reply_style),
            now: Local::now(),
            chat_kind: if is_group {
                ChatKind::Group
            } else {
                ChatKind::Private
            },
            group: group_meta,
            history,
            target: TargetMessage {
                user_id: ev.user_id,
                user_name: ev.sender.display_name().to_string(),
                user_role: Some(ev.sender.role.as_str().to_string()),
                user_title: ev.sender.title.clone(),
                message_id: ev.message_id,
                text: display_text.clone(),
            },
            planner_reason,
            memory_context,
            topic_context,
            expression_context,
            tool_results: vec![],
            iteration: 0,
            loaded_skills: vec![],
            external_skills: self.skills.list_global(),
            enable_external_skills: self.config.enable_external_skills,
            admin_tools_enabled,
            can_mute: is_group && bot_role.is_admin(),
        };
        let tool_ctx = Arc::new(ToolContext {
            gateway: self.gateway.clone(),
            store: self.store.clone(),
            skills: self.skills.clone(),
            config: self.config.clone(),
            session_id: session_id.to_string(),
            group_id: ev.group_id,
            user_id: ev.user_id,
            message_id: ev.message_id,
            bot_role,
        });

        let outcome = self.engine.run_chat(prompt_ctx, tool_ctx).await?;
        if outcome.messages.is_empty() {
            return Ok(());
        }

        if self.config.frequency.enabled {
            let total_len: usize = outcome.messages.iter().map(|m| m.chars().count()).sum();
            tokio::time::sleep(self.frequency.typing_delay(total_len)).await;
        }

        let mut first_send = true;
        for (index, message) in outcome.messages.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(SEND_PACING).await;
            }
            for line in message.split('\n') {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if !first_send {
                    tokio::time::sleep(SEND_PACING).await;
                }
                let body = humanize_typos(line, &self.config.typo);

                let mut segments = Vec::new();
                if first_send {
                    if let Some(quoted) = outcome.pending_quote {
                        segments.push(Segment::reply(quoted));
                    }
                    for user_id in &outcome.pending_ats {
                        segments.push(Segment::at(*user_id));
                    }
                }
                segments.push(Segment::text(body));

                let result = match ev.group_id {
                    Some(group_id) => self.gateway.send_group_msg(group_id, &segments).await,
                    None => self.gateway.send_private_msg(ev.user_id, &segments).await,
                };
                if let Err(e) = result {
                    warn!(session_id, error = %e, "send failed");
                }
                first_send = false;
            }
        }

        if let Some(group_id) = ev.group_id {
            self.recent_replies
                .lock()
                .unwrap()
                .insert((group_id, ev.user_id), Utc::now());
        }

        if let Some(path) = &outcome.emoji_path {
            let segment = Segment::image(format!("file://{}", path.display()));
            let result = match ev.group_id {
                Some(group_id) => self.gateway.send_group_msg(group_id, &[segment]).await,
                None => self.gateway.send_private_msg(ev.user_id, &[segment]).await,
            };
            if let Err(e) = result {
                warn!(session_id, error = %e, "emoji send failed");
            }
        }

        self.frequency.record_speak(session_id);
        Ok(())
    }

    fn bot_name(&self) -> String {
        self.config
            .nicknames
            .first()
            .cloned()
            .unwrap_or_else(|| "bot".to_string())
    }

    /// Grab the in-flight slot for a session directly, as a concurrent
    /// `process_chat` would.
    #[cfg(test)]
    pub(crate) fn try_hold_in_flight(&self, session_id: &str) -> Option<InFlightGuard> {
        InFlightGuard::acquire(&self.in_flight, session_id)
    }

    #[cfg(test)]
    pub(crate) fn seed_follow_up(&self, group_id: i64, user_id: i64, at: DateTime<Utc>) {
        self.recent_replies
            .lock()
            .unwrap()
            .insert((group_id, user_id), at);
    }

    #[cfg(test)]
    pub(crate) fn has_follow_up(&self, group_id: i64, user_id: i64) -> bool {
        self.recent_replies
            .lock()
            .unwrap()
            .contains_key(&(group_id, user_id))
    }
}

/// Flatten segments into (persisted content, display text).
///
/// Text-only messages persist as plain text. When attachments are present
/// the persisted form is a serialized content-part array so a multimodal
/// model can be replayed against it; the display text uses placeholders.
fn extract_content(segments: &[Segment]) -> (String, String) {
    let mut parts: Vec<serde_json::Value> = Vec::new();
    let mut display = String::new();
    let mut has_attachment = false;

    for segment in segments {
        match segment {
            Segment::Text { text } => {
                if !text.is_empty() {
                    parts.push(json!({"type": "text", "text": text}));
                    display.push_str(text);
                }
            }
            Segment::Image { file, url } => {
                has_attachment = true;
                let reference = url.clone().unwrap_or_else(|| file.clone());
                parts.push(json!({"type": "image_url", "image_url": {"url": reference}}));
                display.push_str("[图片]");
            }
            Segment::Record { .. } => {
                parts.push(json!({"type": "text", "text": "[语音]"}));
                display.push_str("[语音]");
            }
            Segment::Video { .. } => {
                parts.push(json!({"type": "text", "text": "[视频]"}));
                display.push_str("[视频]");
            }
            Segment::At { .. } | Segment::Reply { .. } => {}
        }
    }

    let display = display.trim().to_string();
    let persisted = if has_attachment {
        serde_json::to_string(&parts).unwrap_or_else(|_| display.clone())
    } else {
        display.clone()
    };
    (persisted, display)
}
