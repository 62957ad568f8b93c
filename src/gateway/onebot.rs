//! OneBot v11 gateway: HTTP API client for outbound actions plus an axum
//! webhook that feeds inbound events into the dispatcher.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::OneBotConfig;
use crate::traits::{
    BotEvent, BotGateway, FetchedMessage, GroupInfo, GroupRole, MemberInfo, MessageEvent,
    PokeEvent, Segment, Sender,
};

const API_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OneBotGateway {
    client: Client,
    api_url: String,
    access_token: Option<String>,
}

impl OneBotGateway {
    pub fn new(cfg: &OneBotConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: crate::providers::build_http_client(API_TIMEOUT)?,
            api_url: cfg.api_url.trim_end_matches('/').to_string(),
            access_token: cfg.access_token.clone(),
        })
    }

    /// One POST per action; unwraps the protocol envelope.
    async fn call(&self, action: &str, params: Value) -> anyhow::Result<Value> {
        let url = format!("{}/{action}", self.api_url);
        let mut request = self.client.post(&url).json(&params);
        if let Some(token) = &self.access_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("gateway action {action} returned {status}");
        }
        let envelope: Value = response.json().await?;
        let retcode = envelope.get("retcode").and_then(|v| v.as_i64()).unwrap_or(-1);
        if retcode != 0 {
            anyhow::bail!(
                "gateway action {action} failed (retcode {retcode}): {}",
                envelope.get("wording").and_then(|v| v.as_str()).unwrap_or("")
            );
        }
        Ok(envelope.get("data").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl BotGateway for OneBotGateway {
    async fn send_group_msg(&self, group_id: i64, segments: &[Segment]) -> anyhow::Result<i64> {
        let data = self
            .call(
                "send_group_msg",
                json!({"group_id": group_id, "message": segments}),
            )
            .await?;
        Ok(data.get("message_id").and_then(|v| v.as_i64()).unwrap_or(0))
    }

    async fn send_private_msg(&self, user_id: i64, segments: &[Segment]) -> anyhow::Result<i64> {
        let data = self
            .call(
                "send_private_msg",
                json!({"user_id": user_id, "message": segments}),
            )
            .await?;
        Ok(data.get("message_id").and_then(|v| v.as_i64()).unwrap_or(0))
    }

    async fn get_msg(&self, message_id: i64) -> anyhow::Result<FetchedMessage> {
        let data = self.call("get_msg", json!({"message_id": message_id})).await?;
        Ok(FetchedMessage {
            message_id,
            sender: parse_sender(data.get("sender").unwrap_or(&Value::Null)),
            segments: parse_segments(data.get("message").unwrap_or(&Value::Null)),
        })
    }

    async fn get_group_info(&self, group_id: i64) -> anyhow::Result<GroupInfo> {
        let data = self
            .call("get_group_info", json!({"group_id": group_id}))
            .await?;
        Ok(GroupInfo {
            group_id,
            group_name: data
                .get("group_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            member_count: data
                .get("member_count")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
        })
    }

    async fn get_group_member_info(
        &self,
        group_id: i64,
        user_id: i64,
    ) -> anyhow::Result<MemberInfo> {
        let data = self
            .call(
                "get_group_member_info",
                json!({"group_id": group_id, "user_id": user_id}),
            )
            .await?;
        Ok(parse_member(&data))
    }

    async fn get_group_member_list(&self, group_id: i64) -> anyhow::Result<Vec<MemberInfo>> {
        let data = self
            .call("get_group_member_list", json!({"group_id": group_id}))
            .await?;
        Ok(data
            .as_array()
            .map(|members| members.iter().map(parse_member).collect())
            .unwrap_or_default())
    }

    async fn set_group_ban(
        &self,
        group_id: i64,
        user_id: i64,
        duration_s: u64,
    ) -> anyhow::Result<()> {
        self.call(
            "set_group_ban",
            json!({"group_id": group_id, "user_id": user_id, "duration": duration_s}),
        )
        .await?;
        Ok(())
    }

    async fn set_group_kick(&self, group_id: i64, user_id: i64) -> anyhow::Result<()> {
        self.call(
            "set_group_kick",
            json!({"group_id": group_id, "user_id": user_id}),
        )
        .await?;
        Ok(())
    }

    async fn set_group_card(&self, group_id: i64, user_id: i64, card: &str) -> anyhow::Result<()> {
        self.call(
            "set_group_card",
            json!({"group_id": group_id, "user_id": user_id, "card": card}),
        )
        .await?;
        Ok(())
    }

    async fn set_group_special_title(
        &self,
        group_id: i64,
        user_id: i64,
        title: &str,
    ) -> anyhow::Result<()> {
        self.call(
            "set_group_special_title",
            json!({"group_id": group_id, "user_id": user_id, "special_title": title}),
        )
        .await?;
        Ok(())
    }

    async fn set_group_whole_ban(&self, group_id: i64, enable: bool) -> anyhow::Result<()> {
        self.call(
            "set_group_whole_ban",
            json!({"group_id": group_id, "enable": enable}),
        )
        .await?;
        Ok(())
    }

    async fn group_poke(&self, group_id: i64, user_id: i64) -> anyhow::Result<()> {
        self.call(
            "group_poke",
            json!({"group_id": group_id, "user_id": user_id}),
        )
        .await?;
        Ok(())
    }
}

fn parse_sender(value: &Value) -> Sender {
    Sender {
        user_id: value.get("user_id").and_then(|v| v.as_i64()).unwrap_or(0),
        nickname: value
            .get("nickname")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        card: value
            .get("card")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        role: value
            .get("role")
            .and_then(|v| v.as_str())
            .map(GroupRole::parse)
            .unwrap_or_default(),
        title: value
            .get("title")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    }
}

fn parse_member(value: &Value) -> MemberInfo {
    let sender = parse_sender(value);
    MemberInfo {
        user_id: sender.user_id,
        nickname: sender.nickname,
        card: sender.card,
        role: sender.role,
        title: sender.title,
    }
}

/// Message content arrives as a segment array, or as a raw string on legacy
/// implementations; unknown segment types are skipped.
fn parse_segments(value: &Value) -> Vec<Segment> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        Value::String(text) => vec![Segment::text(text.clone())],
        _ => Vec::new(),
    }
}

/// Parse one webhook payload into a dispatcher event.
pub fn parse_event(payload: &Value) -> Option<BotEvent> {
    match payload.get("post_type").and_then(|v| v.as_str())? {
        "message" => {
            let message_type = payload.get("message_type").and_then(|v| v.as_str())?;
            let group_id = match message_type {
                "group" => Some(payload.get("group_id")?.as_i64()?),
                "private" => None,
                _ => return None,
            };
            Some(BotEvent::Message(MessageEvent {
                message_id: payload.get("message_id").and_then(|v| v.as_i64())?,
                self_id: payload.get("self_id").and_then(|v| v.as_i64())?,
                group_id,
                user_id: payload.get("user_id").and_then(|v| v.as_i64())?,
                sender: parse_sender(payload.get("sender").unwrap_or(&Value::Null)),
                segments: parse_segments(payload.get("message").unwrap_or(&Value::Null)),
                time: payload.get("time").and_then(|v| v.as_i64()).unwrap_or(0),
            }))
        }
        "notice" => {
            let notice_type = payload.get("notice_type").and_then(|v| v.as_str())?;
            let sub_type = payload.get("sub_type").and_then(|v| v.as_str());
            if notice_type != "notify" || sub_type != Some("poke") {
                return None;
            }
            Some(BotEvent::Poke(PokeEvent {
                self_id: payload.get("self_id").and_then(|v| v.as_i64())?,
                group_id: payload.get("group_id").and_then(|v| v.as_i64())?,
                user_id: payload.get("user_id").and_then(|v| v.as_i64())?,
                target_id: payload.get("target_id").and_then(|v| v.as_i64())?,
            }))
        }
        _ => None,
    }
}

async fn receive_event(
    State(tx): State<mpsc::Sender<BotEvent>>,
    Json(payload): Json<Value>,
) -> StatusCode {
    match parse_event(&payload) {
        Some(event) => {
            if tx.send(event).await.is_err() {
                warn!("event channel closed, dropping webhook event");
            }
        }
        None => debug!("ignoring unhandled webhook payload"),
    }
    StatusCode::NO_CONTENT
}

/// Run the webhook listener until the process exits.
pub async fn serve_events(listen_addr: &str, tx: mpsc::Sender<BotEvent>) -> anyhow::Result<()> {
    let app = Router::new().route("/", post(receive_event)).with_state(tx);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(listen_addr, "event webhook listening");
    axum::serve(listener, app).await?;
    Ok(())
}
