//! Skill registry: a process-wide catalog of named tool bundles, plus
//! per-session loaded instances with a TTL.
//!
//! Loading a skill copies its tools into the session under fully-qualified
//! names (`skill.tool`). Expired entries are dropped lazily on access and by
//! a periodic sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info};

/// How long a loaded skill stays usable in a session.
pub const SKILL_TTL: Duration = Duration::from_secs(60 * 60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Executes one skill tool. Skill tools receive raw JSON arguments and no
/// request scope; anything they need is captured at registration time.
#[async_trait]
pub trait SkillHandler: Send + Sync {
    async fn call(&self, args: &Value) -> anyhow::Result<String>;
}

#[derive(Clone)]
pub struct SkillTool {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the arguments.
    pub parameters: Value,
    /// Whether the result is fed back into the model's next turn.
    pub return_to_ai: bool,
    pub handler: Arc<dyn SkillHandler>,
}

#[derive(Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub tools: Vec<SkillTool>,
}

/// One skill loaded into one session.
struct SkillSession {
    /// Fully-qualified tool name → tool.
    tools: HashMap<String, SkillTool>,
    expires_at: DateTime<Utc>,
}

#[derive(Default, Clone)]
pub struct SkillRegistry {
    global: Arc<Mutex<HashMap<String, Skill>>>,
    /// session id → skill name → loaded instance.
    sessions: Arc<Mutex<HashMap<String, HashMap<String, SkillSession>>>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, skill: Skill) {
        info!(skill = %skill.name, tools = skill.tools.len(), "Registered skill");
        self.global.lock().unwrap().insert(skill.name.clone(), skill);
    }

    /// Names and descriptions of every registered skill, for prompt listing.
    pub fn list_global(&self) -> Vec<(String, String)> {
        let mut entries: Vec<_> = self
            .global
            .lock()
            .unwrap()
            .values()
            .map(|s| (s.name.clone(), s.description.clone()))
            .collect();
        entries.sort();
        entries
    }

    /// Copy a skill's tools into the session with a fresh TTL. Reloading an
    /// already-loaded skill renews the TTL.
    pub fn load_skill(&self, session_id: &str, skill_name: &str) -> anyhow::Result<usize> {
        let skill = self
            .global
            .lock()
            .unwrap()
            .get(skill_name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown skill '{skill_name}'"))?;

        let mut tools = HashMap::new();
        for tool in &skill.tools {
            tools.insert(format!("{}.{}", skill.name, tool.name), tool.clone());
        }
        let count = tools.len();

        let mut sessions = self.sessions.lock().unwrap();
        sessions.entry(session_id.to_string()).or_default().insert(
            skill_name.to_string(),
            SkillSession {
                tools,
                expires_at: Utc::now() + chrono::Duration::from_std(SKILL_TTL).unwrap_or_default(),
            },
        );
        info!(session_id, skill = skill_name, count, "Loaded skill into session");
        Ok(count)
    }

    /// Remove one loaded skill. Returns false when it wasn't loaded.
    pub fn unload_skill(&self, session_id: &str, skill_name: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(loaded) = sessions.get_mut(session_id) else {
            return false;
        };
        let removed = loaded.remove(skill_name).is_some();
        if loaded.is_empty() {
            sessions.remove(session_id);
        }
        removed
    }

    /// The union of the session's non-expired skill tools, keyed by their
    /// fully-qualified names. Expired skills are dropped on the way.
    pub fn get_tools(&self, session_id: &str) -> Vec<(String, SkillTool)> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().unwrap();
        let Some(loaded) = sessions.get_mut(session_id) else {
            return Vec::new();
        };

        loaded.retain(|name, s| {
            let live = s.expires_at > now;
            if !live {
                debug!(session_id, skill = %name, "Skill session expired");
            }
            live
        });

        let mut tools: Vec<_> = loaded
            .values()
            .flat_map(|s| s.tools.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect();
        if loaded.is_empty() {
            sessions.remove(session_id);
        }
        tools.sort_by(|a, b| a.0.cmp(&b.0));
        tools
    }

    /// Names of skills currently loaded (and live) in the session.
    pub fn loaded_skills(&self, session_id: &str) -> Vec<String> {
        let now = Utc::now();
        let sessions = self.sessions.lock().unwrap();
        let Some(loaded) = sessions.get(session_id) else {
            return Vec::new();
        };
        let mut names: Vec<_> = loaded
            .iter()
            .filter(|(_, s)| s.expires_at > now)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Purge expired skill sessions and empty session maps.
    pub fn sweep(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|session_id, loaded| {
            loaded.retain(|name, s| {
                let live = s.expires_at > now;
                if !live {
                    debug!(session_id, skill = %name, "Swept expired skill session");
                }
                live
            });
            !loaded.is_empty()
        });
    }

    pub fn spawn_sweep(&self) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                registry.sweep();
            }
        });
    }

    #[cfg(test)]
    fn force_expire(&self, session_id: &str, skill_name: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(s) = sessions
            .get_mut(session_id)
            .and_then(|m| m.get_mut(skill_name))
        {
            s.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl SkillHandler for Echo {
        async fn call(&self, args: &Value) -> anyhow::Result<String> {
            Ok(args.to_string())
        }
    }

    fn weather_skill() -> Skill {
        Skill {
            name: "weather".to_string(),
            description: "weather lookups".to_string(),
            tools: vec![SkillTool {
                name: "current".to_string(),
                description: "current weather".to_string(),
                parameters: json!({"type": "object", "properties": {"city": {"type": "string"}}}),
                return_to_ai: true,
                handler: Arc::new(Echo),
            }],
        }
    }

    #[test]
    fn loaded_tools_are_namespaced() {
        let registry = SkillRegistry::new();
        registry.register(weather_skill());
        registry.load_skill("s1", "weather").unwrap();

        let tools = registry.get_tools("s1");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].0, "weather.current");
        assert!(registry.get_tools("s2").is_empty());
    }

    #[test]
    fn unknown_skill_fails_to_load() {
        let registry = SkillRegistry::new();
        assert!(registry.load_skill("s1", "nope").is_err());
    }

    #[test]
    fn expired_tools_vanish_on_access() {
        let registry = SkillRegistry::new();
        registry.register(weather_skill());
        registry.load_skill("s1", "weather").unwrap();
        registry.force_expire("s1", "weather");

        assert!(registry.get_tools("s1").is_empty());
        assert!(registry.loaded_skills("s1").is_empty());
    }

    #[test]
    fn sweep_purges_expired_and_empty_sessions() {
        let registry = SkillRegistry::new();
        registry.register(weather_skill());
        registry.load_skill("s1", "weather").unwrap();
        registry.force_expire("s1", "weather");
        registry.sweep();

        assert!(registry.sessions.lock().unwrap().is_empty());
    }

    #[test]
    fn unload_removes_only_named_skill() {
        let registry = SkillRegistry::new();
        registry.register(weather_skill());
        registry.register(Skill {
            name: "notes".to_string(),
            description: String::new(),
            tools: vec![],
        });
        registry.load_skill("s1", "weather").unwrap();
        registry.load_skill("s1", "notes").unwrap();

        assert!(registry.unload_skill("s1", "weather"));
        assert!(!registry.unload_skill("s1", "weather"));
        assert_eq!(registry.loaded_skills("s1"), vec!["notes".to_string()]);
    }
}
