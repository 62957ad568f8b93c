use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One element of a chat message. The gateway wire format is an array of
/// typed segments; heterogeneous content (text, mentions, images, quotes)
/// is modeled as a tagged variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String },
    /// An @-mention. `qq` is the target user id as a decimal string (the
    /// wire format uses strings for ids inside segment data).
    At { qq: String },
    Image {
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// A quote-reply referencing an earlier message by gateway id.
    Reply { id: String },
    Record { file: String },
    Video { file: String },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Segment::Text { text: text.into() }
    }

    pub fn at(user_id: i64) -> Self {
        Segment::At {
            qq: user_id.to_string(),
        }
    }

    pub fn image(file: impl Into<String>) -> Self {
        Segment::Image {
            file: file.into(),
            url: None,
        }
    }

    pub fn reply(message_id: i64) -> Self {
        Segment::Reply {
            id: message_id.to_string(),
        }
    }

    /// The mentioned user id, if this is an @-segment.
    pub fn at_target(&self) -> Option<i64> {
        match self {
            Segment::At { qq } => qq.parse().ok(),
            _ => None,
        }
    }

    /// The referenced message id, if this is a quote segment.
    pub fn reply_target(&self) -> Option<i64> {
        match self {
            Segment::Reply { id } => id.parse().ok(),
            _ => None,
        }
    }
}

/// Concatenate the plain-text parts of a segment list.
pub fn plain_text(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        if let Segment::Text { text } = segment {
            out.push_str(text);
        }
    }
    out.trim().to_string()
}

/// Group membership level of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Owner,
    Admin,
    #[default]
    Member,
}

impl GroupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupRole::Owner => "owner",
            GroupRole::Admin => "admin",
            GroupRole::Member => "member",
        }
    }

    /// True for roles allowed to use group-management surfaces.
    pub fn is_admin(&self) -> bool {
        matches!(self, GroupRole::Owner | GroupRole::Admin)
    }

    pub fn parse(s: &str) -> GroupRole {
        match s {
            "owner" => GroupRole::Owner,
            "admin" => GroupRole::Admin,
            _ => GroupRole::Member,
        }
    }
}

/// Who sent a message.
#[derive(Debug, Clone, Default)]
pub struct Sender {
    pub user_id: i64,
    pub nickname: String,
    /// Group display name, when set.
    pub card: Option<String>,
    pub role: GroupRole,
    /// Special title granted by the group owner.
    pub title: Option<String>,
}

impl Sender {
    /// Preferred display name: card if set, else nickname.
    pub fn display_name(&self) -> &str {
        match self.card.as_deref() {
            Some(card) if !card.is_empty() => card,
            _ => &self.nickname,
        }
    }
}

/// An inbound chat message event.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// Gateway-assigned id of this message.
    pub message_id: i64,
    /// The bot's own account id.
    pub self_id: i64,
    /// Set for group messages; `None` for private chats.
    pub group_id: Option<i64>,
    pub user_id: i64,
    pub sender: Sender,
    pub segments: Vec<Segment>,
    /// Event time as a unix timestamp (seconds).
    pub time: i64,
}

impl MessageEvent {
    /// True if any segment @-mentions the bot.
    pub fn mentions_bot(&self) -> bool {
        self.segments
            .iter()
            .any(|s| s.at_target() == Some(self.self_id))
    }

    /// The first quoted message id, if the event is a reply.
    pub fn quoted_message_id(&self) -> Option<i64> {
        self.segments.iter().find_map(Segment::reply_target)
    }

    pub fn plain_text(&self) -> String {
        plain_text(&self.segments)
    }
}

/// A group poke notification.
#[derive(Debug, Clone)]
pub struct PokeEvent {
    pub self_id: i64,
    pub group_id: i64,
    pub user_id: i64,
    /// Who was poked.
    pub target_id: i64,
}

/// Events the dispatcher consumes.
#[derive(Debug, Clone)]
pub enum BotEvent {
    Message(MessageEvent),
    Poke(PokeEvent),
}

#[derive(Debug, Clone, Default)]
pub struct GroupInfo {
    pub group_id: i64,
    pub group_name: String,
    pub member_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MemberInfo {
    pub user_id: i64,
    pub nickname: String,
    pub card: Option<String>,
    pub role: GroupRole,
    pub title: Option<String>,
}

impl MemberInfo {
    pub fn display_name(&self) -> &str {
        match self.card.as_deref() {
            Some(card) if !card.is_empty() => card,
            _ => &self.nickname,
        }
    }
}

/// A message fetched back from the gateway by id.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub message_id: i64,
    pub sender: Sender,
    pub segments: Vec<Segment>,
}

/// Bot gateway — the platform connection used to send messages and manage
/// groups. One implementation speaks the real wire protocol; tests use a
/// recording stub.
#[async_trait]
pub trait BotGateway: Send + Sync {
    /// Send segments to a group. Returns the gateway message id.
    async fn send_group_msg(&self, group_id: i64, segments: &[Segment]) -> anyhow::Result<i64>;

    /// Send segments to a user directly. Returns the gateway message id.
    async fn send_private_msg(&self, user_id: i64, segments: &[Segment]) -> anyhow::Result<i64>;

    /// Fetch a previously seen message by id.
    async fn get_msg(&self, message_id: i64) -> anyhow::Result<FetchedMessage>;

    async fn get_group_info(&self, group_id: i64) -> anyhow::Result<GroupInfo>;

    async fn get_group_member_info(
        &self,
        group_id: i64,
        user_id: i64,
    ) -> anyhow::Result<MemberInfo>;

    async fn get_group_member_list(&self, group_id: i64) -> anyhow::Result<Vec<MemberInfo>>;

    /// Mute a member for `duration_s` seconds; 0 lifts the mute.
    async fn set_group_ban(
        &self,
        group_id: i64,
        user_id: i64,
        duration_s: u64,
    ) -> anyhow::Result<()>;

    async fn set_group_kick(&self, group_id: i64, user_id: i64) -> anyhow::Result<()>;

    async fn set_group_card(&self, group_id: i64, user_id: i64, card: &str) -> anyhow::Result<()>;

    async fn set_group_special_title(
        &self,
        group_id: i64,
        user_id: i64,
        title: &str,
    ) -> anyhow::Result<()>;

    async fn set_group_whole_ban(&self, group_id: i64, enable: bool) -> anyhow::Result<()>;

    async fn group_poke(&self, group_id: i64, user_id: i64) -> anyhow::Result<()>;
}
