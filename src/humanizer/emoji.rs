//! Emoji (sticker) system: registers image files with an LLM-tagged emotion
//! label, harvests stickers out of inbound messages, and occasionally picks
//! one to send with a reply.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};

use super::parse_lenient_json;
use crate::config::EmojiConfig;
use crate::store::{EmojiRow, SqliteStore};
use crate::traits::{ChatOptions, LlmClient, Segment};

/// The closed emotion taxonomy. Everything the tagger emits is normalized
/// into one of these labels.
pub const EMOTIONS: [&str; 13] = [
    "happy",
    "sad",
    "angry",
    "surprised",
    "disgusted",
    "scared",
    "neutral",
    "funny",
    "cute",
    "confused",
    "excited",
    "tired",
    "love",
];

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];
const PICK_LIMIT: u32 = 5;
const NEUTRAL_FALLBACK_LIMIT: u32 = 3;

/// Quick keyword classifier consulted before spending an LLM call.
static EMOTION_CUES: Lazy<Vec<(&'static str, &'static [&'static str])>> = Lazy::new(|| {
    vec![
        ("happy", &["开心", "高兴", "哈哈", "太好了", "happy", "yay", "great"] as &[_]),
        ("sad", &["难过", "伤心", "呜呜", "哭", "sad", "cry"]),
        ("angry", &["生气", "气死", "愤怒", "恼火", "angry", "mad"]),
        ("surprised", &["惊讶", "震惊", "没想到", "居然", "wow", "what"]),
        ("scared", &["害怕", "吓", "恐怖", "scary", "afraid"]),
        ("funny", &["笑死", "搞笑", "离谱", "绷不住", "lol", "lmao"]),
        ("cute", &["可爱", "萌", "乖", "cute", "adorable"]),
        ("confused", &["迷惑", "不懂", "啥意思", "问号", "confused", "huh"]),
        ("excited", &["激动", "冲", "期待", "兴奋", "excited", "hype"]),
        ("tired", &["累", "困", "摸鱼", "睡了", "tired", "sleepy"]),
        ("love", &["喜欢", "爱了", "心动", "爱你", "love", "<3"]),
    ]
});

#[derive(Clone)]
pub struct EmojiSystem {
    llm: Arc<dyn LlmClient>,
    store: Arc<SqliteStore>,
    cfg: EmojiConfig,
    model: String,
    is_multimodal: bool,
    http: reqwest::Client,
}

impl EmojiSystem {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        store: Arc<SqliteStore>,
        cfg: EmojiConfig,
        model: String,
        is_multimodal: bool,
    ) -> Self {
        Self {
            llm,
            store,
            cfg,
            model,
            is_multimodal,
            http: reqwest::Client::new(),
        }
    }

    /// Scan the emoji directory and register any image file the store has
    /// not seen yet. Called once at startup.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let dir = PathBuf::from(&self.cfg.emoji_dir);
        tokio::fs::create_dir_all(&dir).await?;

        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut registered = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_image_file(&path) {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if self.store.has_emoji(file_name).await? {
                continue;
            }
            if let Err(e) = self.register(&path).await {
                warn!(file = %path.display(), error = %e, "emoji registration failed");
            } else {
                registered += 1;
            }
        }
        info!(dir = %dir.display(), registered, "Emoji directory scanned");
        Ok(())
    }

    async fn register(&self, path: &Path) -> anyhow::Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("bad emoji file name"))?;
        let (description, emotion) = self.analyze_emotion(path).await;
        self.store
            .save_emoji(file_name, &description, &emotion)
            .await?;
        debug!(file_name, emotion = %emotion, "registered emoji");
        Ok(())
    }

    /// Tag an image with a description and an emotion from the taxonomy.
    /// Without a multimodal model this degrades to the file name + neutral.
    async fn analyze_emotion(&self, path: &Path) -> (String, String) {
        let fallback = || {
            let name = path
                .file_stem()
                .and_then(|n| n.to_str())
                .unwrap_or("emoji")
                .to_string();
            (name, "neutral".to_string())
        };

        if !self.is_multimodal {
            return fallback();
        }

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "emoji read failed");
                return fallback();
            }
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let data_url = format!("data:{};base64,{}", mime_for(path), encoded);

        let messages = vec![json!({
            "role": "user",
            "content": [
                {"type": "text", "text": format!(
                    "这是一张表情包。描述它并选一个情绪标签。\
                     输出 JSON: {{\"description\": \"一句话描述\", \"emotion\": \"标签\"}}\n\
                     标签必须是其中之一: {}", EMOTIONS.join(", ")
                )},
                {"type": "image_url", "image_url": {"url": data_url}}
            ]
        })];

        match self
            .llm
            .generate_multimodal(&self.model, &messages, &ChatOptions::with_temperature(0.2))
            .await
        {
            Ok(text) => {
                let Some(value) = parse_lenient_json(&text) else {
                    return fallback();
                };
                let description = value
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let emotion = value
                    .get("emotion")
                    .and_then(|v| v.as_str())
                    .map(normalize_emotion)
                    .unwrap_or_else(|| "neutral".to_string());
                if description.is_empty() {
                    fallback()
                } else {
                    (description, emotion)
                }
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "emoji analysis failed");
                fallback()
            }
        }
    }

    /// Try to harvest sticker images out of an inbound message. Downloads
    /// run detached; failures only log.
    pub fn collect_from_segments(&self, segments: &[Segment]) {
        if !self.cfg.enabled {
            return;
        }
        for segment in segments {
            let Segment::Image { file, url } = segment else {
                continue;
            };
            let Some(url) = url.clone() else { continue };
            let file_name = sanitize_file_name(file);
            if file_name.is_empty() || !has_image_extension(&file_name) {
                continue;
            }
            let system = self.clone();
            tokio::spawn(async move {
                if let Err(e) = system.download_and_register(&url, &file_name).await {
                    debug!(file_name, error = %e, "emoji collection failed");
                }
            });
        }
    }

    async fn download_and_register(&self, url: &str, file_name: &str) -> anyhow::Result<()> {
        if self.store.has_emoji(file_name).await? {
            return Ok(());
        }
        let bytes = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let path = PathBuf::from(&self.cfg.emoji_dir).join(file_name);
        tokio::fs::create_dir_all(path.parent().unwrap_or(Path::new("."))).await?;
        tokio::fs::write(&path, &bytes).await?;
        self.register(&path).await
    }

    /// Maybe pick a sticker to accompany the reply. Returns a path under the
    /// emoji directory.
    pub async fn pick_emoji(&self, reply_text: &str) -> Option<PathBuf> {
        if !self.cfg.enabled {
            return None;
        }
        if !rand::thread_rng().gen_bool(self.cfg.send_probability.clamp(0.0, 1.0)) {
            return None;
        }

        let emotion = match keyword_emotion(reply_text) {
            Some(emotion) => emotion.to_string(),
            None => self.classify_with_llm(reply_text).await,
        };

        let mut candidates = self
            .store
            .get_emojis_by_emotion(&emotion, PICK_LIMIT)
            .await
            .ok()?;
        if candidates.is_empty() && emotion != "neutral" {
            candidates = self
                .store
                .get_emojis_by_emotion("neutral", NEUTRAL_FALLBACK_LIMIT)
                .await
                .ok()?;
        }
        if candidates.is_empty() {
            return None;
        }

        let chosen = weighted_pick(&candidates)?;
        if let Err(e) = self.store.increment_emoji_usage(chosen.id).await {
            warn!(error = %e, "emoji usage increment failed");
        }
        Some(PathBuf::from(&self.cfg.emoji_dir).join(&chosen.file_name))
    }

    async fn classify_with_llm(&self, reply_text: &str) -> String {
        let prompt = format!(
            "这条消息的情绪最接近哪个标签？只输出标签本身。\n\
             标签: {}\n消息: {}",
            EMOTIONS.join(", "),
            reply_text
        );
        match self
            .llm
            .generate_text(
                &self.model,
                &[json!({"role": "user", "content": prompt})],
                &ChatOptions {
                    temperature: Some(0.1),
                    max_tokens: Some(10),
                },
            )
            .await
        {
            Ok(text) => normalize_emotion(&text),
            Err(e) => {
                debug!(error = %e, "emoji emotion classification failed");
                "neutral".to_string()
            }
        }
    }
}

/// Inverse-usage weighting: rarely-sent stickers get picked more so the bot
/// doesn't wear one joke out.
fn weighted_pick(candidates: &[EmojiRow]) -> Option<&EmojiRow> {
    let max_usage = candidates.iter().map(|e| e.usage_count).max().unwrap_or(0);
    candidates
        .choose_weighted(&mut rand::thread_rng(), |e| {
            (max_usage + 1 - e.usage_count + 1) as f64
        })
        .ok()
}

fn keyword_emotion(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    for (emotion, cues) in EMOTION_CUES.iter() {
        if cues.iter().any(|cue| lower.contains(cue)) {
            return Some(emotion);
        }
    }
    None
}

fn normalize_emotion(raw: &str) -> String {
    let candidate = raw.trim().to_lowercase();
    EMOTIONS
        .iter()
        .find(|e| candidate.contains(*e))
        .map(|e| e.to_string())
        .unwrap_or_else(|| "neutral".to_string())
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

fn has_image_extension(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

/// Strip anything that could escape the emoji directory.
fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubLlm;

    async fn setup() -> (Arc<SqliteStore>, tempfile::NamedTempFile) {
        let db_file = tempfile::NamedTempFile::new().unwrap();
        let store = Arc::new(
            SqliteStore::new(db_file.path().to_str().unwrap())
                .await
                .unwrap(),
        );
        (store, db_file)
    }

    #[test]
    fn keyword_classifier_hits_chinese_and_english() {
        assert_eq!(keyword_emotion("今天太开心了"), Some("happy"));
        assert_eq!(keyword_emotion("lol that's wild"), Some("funny"));
        assert_eq!(keyword_emotion("平平无奇的一句话"), None);
    }

    #[test]
    fn emotion_normalization_defaults_to_neutral() {
        assert_eq!(normalize_emotion(" Happy "), "happy");
        assert_eq!(normalize_emotion("the label is: cute!"), "cute");
        assert_eq!(normalize_emotion("melancholy"), "neutral");
    }

    #[test]
    fn weighted_pick_prefers_unused() {
        let mk = |id, usage| EmojiRow {
            id,
            file_name: format!("{id}.png"),
            description: String::new(),
            emotion: "happy".to_string(),
            usage_count: usage,
            created_at: chrono::Utc::now(),
        };
        // Weights: used 100 times -> 1, never used -> 101.
        let candidates = vec![mk(1, 100), mk(2, 0)];
        let mut unused_hits = 0;
        for _ in 0..200 {
            if weighted_pick(&candidates).unwrap().id == 2 {
                unused_hits += 1;
            }
        }
        assert!(unused_hits > 150);
    }

    #[test]
    fn file_name_sanitization_blocks_traversal() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "....etcpasswd");
        assert_eq!(sanitize_file_name("cat-01.png"), "cat-01.png");
    }

    #[tokio::test]
    async fn bootstrap_registers_new_files_without_multimodal() {
        let (store, _db) = setup().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cat.png"), b"fake").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();

        let llm = Arc::new(StubLlm::always_text("unused"));
        let system = EmojiSystem::new(
            llm.clone(),
            store.clone(),
            EmojiConfig {
                emoji_dir: dir.path().to_str().unwrap().to_string(),
                ..Default::default()
            },
            "m".to_string(),
            false,
        );
        system.bootstrap().await.unwrap();

        let all = store.get_all_emojis().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].file_name, "cat.png");
        assert_eq!(all[0].emotion, "neutral");
        assert_eq!(all[0].description, "cat");
        // Fallback path never touches the model.
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn pick_uses_keyword_emotion_and_increments_usage() {
        let (store, _db) = setup().await;
        store.save_emoji("happy.png", "", "happy").await.unwrap();

        let llm = Arc::new(StubLlm::always_text("unused"));
        let system = EmojiSystem::new(
            llm.clone(),
            store.clone(),
            EmojiConfig {
                send_probability: 1.0,
                emoji_dir: "emojis".to_string(),
                ..Default::default()
            },
            "m".to_string(),
            false,
        );

        let path = system.pick_emoji("哈哈 太好了").await.unwrap();
        assert!(path.ends_with("happy.png"));
        // Keyword hit: no LLM classification round.
        assert_eq!(llm.call_count(), 0);
        let all = store.get_all_emojis().await.unwrap();
        assert_eq!(all[0].usage_count, 1);
    }

    #[tokio::test]
    async fn pick_falls_back_to_neutral() {
        let (store, _db) = setup().await;
        store.save_emoji("shrug.png", "", "neutral").await.unwrap();

        let llm = Arc::new(StubLlm::always_text("sad"));
        let system = EmojiSystem::new(
            llm,
            store,
            EmojiConfig {
                send_probability: 1.0,
                ..Default::default()
            },
            "m".to_string(),
            false,
        );
        // LLM classifies as sad, no sad emojis exist, neutral is served.
        let path = system.pick_emoji("一句没有情绪线索的话").await.unwrap();
        assert!(path.ends_with("shrug.png"));
    }

    #[tokio::test]
    async fn zero_probability_never_picks() {
        let (store, _db) = setup().await;
        store.save_emoji("happy.png", "", "happy").await.unwrap();
        let llm = Arc::new(StubLlm::always_text("unused"));
        let system = EmojiSystem::new(
            llm,
            store,
            EmojiConfig {
                send_probability: 0.0,
                ..Default::default()
            },
            "m".to_string(),
            false,
        );
        assert!(system.pick_emoji("哈哈").await.is_none());
    }
}
