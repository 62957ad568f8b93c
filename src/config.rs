use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Chat-completions endpoint base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Cheaper model for background analyzers (planner, topics, emoji
    /// tagging). Falls back to `model` when unset.
    pub working_model: Option<String>,
    #[serde(default)]
    pub is_multimodal: bool,
    /// Names the bot answers to, matched case-insensitively.
    #[serde(default)]
    pub nicknames: Vec<String>,
    #[serde(default = "default_persona")]
    pub persona: String,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_history_count")]
    pub history_count: u32,
    #[serde(default)]
    pub blacklist_groups: Vec<i64>,
    /// When non-empty, only these groups are served (blacklist is ignored).
    #[serde(default)]
    pub whitelist_groups: Vec<i64>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Chat-engine tool loop cap. `-1` means unbounded (still clamped to a
    /// large safety ceiling).
    #[serde(default = "default_max_iterations")]
    pub max_iterations: i32,
    #[serde(default)]
    pub enable_group_admin: bool,
    #[serde(default)]
    pub enable_external_skills: bool,
    /// Bot owners: may `/reset-group` anywhere and receive abuse reports.
    #[serde(default)]
    pub owner_ids: Vec<i64>,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub onebot: OneBotConfig,
    #[serde(default)]
    pub personality: PersonalityConfig,
    #[serde(default)]
    pub reply_style: ReplyStyleConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub topic: TopicConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub frequency: FrequencyConfig,
    #[serde(default)]
    pub typo: TypoConfig,
    #[serde(default)]
    pub emoji: EmojiConfig,
    #[serde(default)]
    pub expression: ExpressionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_persona() -> String {
    "一个爱凑热闹的群友".to_string()
}
fn default_max_context_tokens() -> u32 {
    8
}
fn default_temperature() -> f32 {
    0.8
}
fn default_history_count() -> u32 {
    100
}
fn default_max_sessions() -> usize {
    100
}
fn default_max_iterations() -> i32 {
    20
}
fn default_db_path() -> String {
    "banter.db".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OneBotConfig {
    /// HTTP API endpoint of the protocol implementation.
    #[serde(default = "default_onebot_api_url")]
    pub api_url: String,
    pub access_token: Option<String>,
    /// Address the event webhook listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for OneBotConfig {
    fn default() -> Self {
        Self {
            api_url: default_onebot_api_url(),
            access_token: None,
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_onebot_api_url() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_listen_addr() -> String {
    "127.0.0.1:3511".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PersonalityConfig {
    /// Transient moods mixed into the persona section.
    #[serde(default)]
    pub states: Vec<String>,
    #[serde(default = "default_state_probability")]
    pub state_probability: f32,
}

fn default_state_probability() -> f32 {
    0.15
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplyStyleConfig {
    #[serde(default = "default_base_style")]
    pub base_style: String,
    #[serde(default)]
    pub multiple_styles: Vec<String>,
    #[serde(default)]
    pub multiple_probability: f32,
}

impl Default for ReplyStyleConfig {
    fn default() -> Self {
        Self {
            base_style: default_base_style(),
            multiple_styles: Vec::new(),
            multiple_probability: 0.0,
        }
    }
}

fn default_base_style() -> String {
    "轻松随意，像平时聊天一样".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_memory_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_memory_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: default_memory_max_iterations(),
            timeout_ms: default_memory_timeout_ms(),
        }
    }
}

fn default_memory_max_iterations() -> u32 {
    3
}
fn default_memory_timeout_ms() -> u64 {
    15_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct TopicConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_topic_message_threshold")]
    pub message_threshold: u32,
    #[serde(default = "default_topic_time_threshold_ms")]
    pub time_threshold_ms: u64,
    #[serde(default = "default_max_topics_per_session")]
    pub max_topics_per_session: u32,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            message_threshold: default_topic_message_threshold(),
            time_threshold_ms: default_topic_time_threshold_ms(),
            max_topics_per_session: default_max_topics_per_session(),
        }
    }
}

fn default_topic_message_threshold() -> u32 {
    30
}
fn default_topic_time_threshold_ms() -> u64 {
    10 * 60 * 1000
}
fn default_max_topics_per_session() -> u32 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlannerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FrequencyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    /// Also caps the simulated typing delay.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    #[serde(default = "default_speak_probability")]
    pub speak_probability: f32,
    #[serde(default = "default_quiet_hours_start")]
    pub quiet_hours_start: u32,
    #[serde(default = "default_quiet_hours_end")]
    pub quiet_hours_end: u32,
    #[serde(default = "default_quiet_probability_multiplier")]
    pub quiet_probability_multiplier: f32,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            speak_probability: default_speak_probability(),
            quiet_hours_start: default_quiet_hours_start(),
            quiet_hours_end: default_quiet_hours_end(),
            quiet_probability_multiplier: default_quiet_probability_multiplier(),
        }
    }
}

fn default_min_interval_ms() -> u64 {
    8_000
}
fn default_max_interval_ms() -> u64 {
    10_000
}
fn default_speak_probability() -> f32 {
    0.85
}
fn default_quiet_hours_start() -> u32 {
    1
}
fn default_quiet_hours_end() -> u32 {
    7
}
fn default_quiet_probability_multiplier() -> f32 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct TypoConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-codepoint homophone substitution probability.
    #[serde(default = "default_typo_error_rate")]
    pub error_rate: f64,
    /// Probability of applying one casual-phrase replacement per line.
    #[serde(default = "default_word_replace_rate")]
    pub word_replace_rate: f64,
}

impl Default for TypoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_rate: default_typo_error_rate(),
            word_replace_rate: default_word_replace_rate(),
        }
    }
}

fn default_typo_error_rate() -> f64 {
    0.03
}
fn default_word_replace_rate() -> f64 {
    0.10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmojiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_emoji_dir")]
    pub emoji_dir: String,
    #[serde(default = "default_emoji_send_probability")]
    pub send_probability: f64,
}

impl Default for EmojiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            emoji_dir: default_emoji_dir(),
            send_probability: default_emoji_send_probability(),
        }
    }
}

fn default_emoji_dir() -> String {
    "emojis".to_string()
}
fn default_emoji_send_probability() -> f64 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExpressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_expressions")]
    pub max_expressions: u32,
    #[serde(default = "default_expression_sample_size")]
    pub sample_size: u32,
}

impl Default for ExpressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_expressions: default_max_expressions(),
            sample_size: default_expression_sample_size(),
        }
    }
}

fn default_max_expressions() -> u32 {
    100
}
fn default_expression_sample_size() -> u32 {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_triggers_per_window")]
    pub max_triggers_per_window: u32,
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    #[serde(default = "default_group_cooldown_ms")]
    pub group_cooldown_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_rate_window_ms(),
            max_triggers_per_window: default_max_triggers_per_window(),
            dedup_window_ms: default_dedup_window_ms(),
            group_cooldown_ms: default_group_cooldown_ms(),
        }
    }
}

fn default_rate_window_ms() -> u64 {
    60_000
}
fn default_max_triggers_per_window() -> u32 {
    6
}
fn default_dedup_window_ms() -> u64 {
    30_000
}
fn default_group_cooldown_ms() -> u64 {
    3_000
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.api_key.trim().is_empty() {
            anyhow::bail!("api_key is empty; refusing to start without model access");
        }
        Ok(())
    }

    /// Model used for background analyzers.
    pub fn working_model(&self) -> &str {
        self.working_model.as_deref().unwrap_or(&self.model)
    }

    /// Effective chat-engine iteration cap. `-1` is "unbounded", still
    /// clamped to a safety ceiling.
    pub fn iteration_cap(&self) -> u32 {
        if self.max_iterations < 0 {
            64
        } else {
            self.max_iterations as u32
        }
    }

    /// True when the group passes the allow-list. A non-empty whitelist
    /// wins over the blacklist.
    pub fn group_allowed(&self, group_id: i64) -> bool {
        if !self.whitelist_groups.is_empty() {
            return self.whitelist_groups.contains(&group_id);
        }
        !self.blacklist_groups.contains(&group_id)
    }
}
