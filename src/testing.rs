//! Shared test doubles: a scripted LLM client and a recording gateway.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::AppConfig;
use crate::store::SqliteStore;
use crate::traits::{
    BotGateway, ChatOptions, FetchedMessage, GroupInfo, LlmClient, MemberInfo, ProviderResponse,
    Segment,
};

/// A config with every probabilistic or LLM-backed subsystem switched off.
/// Tests turn on exactly what they exercise.
pub fn test_config() -> AppConfig {
    let mut cfg: AppConfig =
        toml::from_str("api_key = \"sk-test\"").expect("test config parses");
    cfg.nicknames = vec!["miku".to_string()];
    cfg.planner.enabled = false;
    cfg.frequency.enabled = false;
    cfg.typo.enabled = false;
    cfg.emoji.enabled = false;
    cfg.memory.enabled = false;
    cfg.topic.enabled = false;
    cfg.expression.enabled = false;
    cfg.rate_limit.group_cooldown_ms = 0;
    cfg
}

pub async fn temp_store() -> (Arc<SqliteStore>, tempfile::NamedTempFile) {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let store = Arc::new(
        SqliteStore::new(db_file.path().to_str().unwrap())
            .await
            .unwrap(),
    );
    (store, db_file)
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub messages: Vec<Value>,
    pub tools: Vec<Value>,
}

/// Scripted LLM: pops queued responses in order, then falls back to a fixed
/// text (or errors, if constructed with `failing`).
pub struct StubLlm {
    responses: Mutex<VecDeque<ProviderResponse>>,
    fallback_text: Option<String>,
    fail: bool,
    calls: Mutex<Vec<RecordedCall>>,
}

impl StubLlm {
    pub fn always_text(text: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback_text: Some(text.to_string()),
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responses(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            fallback_text: None,
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback_text: None,
            fail: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn next_response(&self) -> anyhow::Result<ProviderResponse> {
        if self.fail {
            anyhow::bail!("stub llm configured to fail");
        }
        if let Some(response) = self.responses.lock().unwrap().pop_front() {
            return Ok(response);
        }
        match &self.fallback_text {
            Some(text) => Ok(ProviderResponse {
                content: Some(text.clone()),
                ..Default::default()
            }),
            None => anyhow::bail!("stub llm response queue exhausted"),
        }
    }
}

#[async_trait]
impl LlmClient for StubLlm {
    async fn complete(
        &self,
        model: &str,
        messages: &[Value],
        tools: &[Value],
        _options: &ChatOptions,
    ) -> anyhow::Result<ProviderResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            model: model.to_string(),
            messages: messages.to_vec(),
            tools: tools.to_vec(),
        });
        self.next_response()
    }

    async fn generate_multimodal(
        &self,
        model: &str,
        messages: &[Value],
        options: &ChatOptions,
    ) -> anyhow::Result<String> {
        self.generate_text(model, messages, options).await
    }
}

/// Gateway double that records every call and serves canned lookups.
#[derive(Default)]
pub struct RecordingGateway {
    pub sent_group: Mutex<Vec<(i64, Vec<Segment>, DateTime<Utc>)>>,
    pub sent_private: Mutex<Vec<(i64, Vec<Segment>)>>,
    pub bans: Mutex<Vec<(i64, i64, u64)>>,
    pub kicks: Mutex<Vec<(i64, i64)>>,
    pub cards: Mutex<Vec<(i64, i64, String)>>,
    pub titles: Mutex<Vec<(i64, i64, String)>>,
    pub whole_bans: Mutex<Vec<(i64, bool)>>,
    pub pokes: Mutex<Vec<(i64, i64)>>,
    members: Mutex<HashMap<(i64, i64), MemberInfo>>,
    fetched: Mutex<HashMap<i64, FetchedMessage>>,
    next_message_id: AtomicI64,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicI64::new(1000),
            ..Default::default()
        }
    }

    pub fn set_member(&self, group_id: i64, member: MemberInfo) {
        self.members
            .lock()
            .unwrap()
            .insert((group_id, member.user_id), member);
    }

    pub fn set_fetched(&self, message: FetchedMessage) {
        self.fetched
            .lock()
            .unwrap()
            .insert(message.message_id, message);
    }

    /// Plain text of every group send, in order.
    pub fn group_texts(&self) -> Vec<String> {
        self.sent_group
            .lock()
            .unwrap()
            .iter()
            .map(|(_, segments, _)| crate::traits::plain_text(segments))
            .collect()
    }

    pub fn group_send_count(&self) -> usize {
        self.sent_group.lock().unwrap().len()
    }
}

#[async_trait]
impl BotGateway for RecordingGateway {
    async fn send_group_msg(&self, group_id: i64, segments: &[Segment]) -> anyhow::Result<i64> {
        self.sent_group
            .lock()
            .unwrap()
            .push((group_id, segments.to_vec(), Utc::now()));
        Ok(self.next_message_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn send_private_msg(&self, user_id: i64, segments: &[Segment]) -> anyhow::Result<i64> {
        self.sent_private
            .lock()
            .unwrap()
            .push((user_id, segments.to_vec()));
        Ok(self.next_message_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn get_msg(&self, message_id: i64) -> anyhow::Result<FetchedMessage> {
        self.fetched
            .lock()
            .unwrap()
            .get(&message_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown message {message_id}"))
    }

    async fn get_group_info(&self, group_id: i64) -> anyhow::Result<GroupInfo> {
        Ok(GroupInfo {
            group_id,
            group_name: "test group".to_string(),
            member_count: 3,
        })
    }

    async fn get_group_member_info(
        &self,
        group_id: i64,
        user_id: i64,
    ) -> anyhow::Result<MemberInfo> {
        Ok(self
            .members
            .lock()
            .unwrap()
            .get(&(group_id, user_id))
            .cloned()
            .unwrap_or(MemberInfo {
                user_id,
                nickname: format!("user{user_id}"),
                ..Default::default()
            }))
    }

    async fn get_group_member_list(&self, group_id: i64) -> anyhow::Result<Vec<MemberInfo>> {
        let members = self.members.lock().unwrap();
        let mut list: Vec<MemberInfo> = members
            .iter()
            .filter(|((gid, _), _)| *gid == group_id)
            .map(|(_, m)| m.clone())
            .collect();
        list.sort_by_key(|m| m.user_id);
        Ok(list)
    }

    async fn set_group_ban(
        &self,
        group_id: i64,
        user_id: i64,
        duration_s: u64,
    ) -> anyhow::Result<()> {
        self.bans.lock().unwrap().push((group_id, user_id, duration_s));
        Ok(())
    }

    async fn set_group_kick(&self, group_id: i64, user_id: i64) -> anyhow::Result<()> {
        self.kicks.lock().unwrap().push((group_id, user_id));
        Ok(())
    }

    async fn set_group_card(&self, group_id: i64, user_id: i64, card: &str) -> anyhow::Result<()> {
        self.cards
            .lock()
            .unwrap()
            .push((group_id, user_id, card.to_string()));
        Ok(())
    }

    async fn set_group_special_title(
        &self,
        group_id: i64,
        user_id: i64,
        title: &str,
    ) -> anyhow::Result<()> {
        self.titles
            .lock()
            .unwrap()
            .push((group_id, user_id, title.to_string()));
        Ok(())
    }

    async fn set_group_whole_ban(&self, group_id: i64, enable: bool) -> anyhow::Result<()> {
        self.whole_bans.lock().unwrap().push((group_id, enable));
        Ok(())
    }

    async fn group_poke(&self, group_id: i64, user_id: i64) -> anyhow::Result<()> {
        self.pokes.lock().unwrap().push((group_id, user_id));
        Ok(())
    }
}
