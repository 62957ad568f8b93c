//! Trigger rate limiting.
//!
//! Three independent predicates, combined as a conjunction: per-group
//! response cooldown, per-user sliding trigger window, and exact-content
//! dedup. Denials are silent; the dispatcher simply drops the event.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::RateLimitConfig;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct RateLimiter {
    cfg: RateLimitConfig,
    inner: Arc<Mutex<RateInner>>,
}

#[derive(Default)]
struct RateInner {
    /// Group id → last time the bot responded there.
    group_last_response: HashMap<i64, DateTime<Utc>>,
    /// User id → trigger timestamps inside the sliding window.
    user_windows: HashMap<i64, VecDeque<DateTime<Utc>>>,
    /// (user id, content) → last time this exact content was accepted.
    recent_content: HashMap<(i64, String), DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            inner: Arc::new(Mutex::new(RateInner::default())),
        }
    }

    /// True when all three checks pass. Does not record.
    pub fn check(&self, user_id: i64, group_id: Option<i64>, content: &str) -> bool {
        let now = Utc::now();
        let inner = self.inner.lock().unwrap();

        if let Some(group_id) = group_id {
            if let Some(last) = inner.group_last_response.get(&group_id) {
                if millis_since(*last, now) < self.cfg.group_cooldown_ms {
                    debug!(group_id, "rate limit: group cooldown");
                    return false;
                }
            }
        }

        if let Some(window) = inner.user_windows.get(&user_id) {
            let in_window = window
                .iter()
                .filter(|t| millis_since(**t, now) < self.cfg.window_ms)
                .count();
            if in_window >= self.cfg.max_triggers_per_window as usize {
                debug!(user_id, in_window, "rate limit: trigger window full");
                return false;
            }
        }

        if let Some(last) = inner.recent_content.get(&(user_id, content.to_string())) {
            if millis_since(*last, now) < self.cfg.dedup_window_ms {
                debug!(user_id, "rate limit: duplicate content");
                return false;
            }
        }

        true
    }

    /// Record an accepted trigger: bumps the user window, the dedup entry,
    /// and the group cooldown.
    pub fn record(&self, user_id: i64, group_id: Option<i64>, content: &str) {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();

        let window = inner.user_windows.entry(user_id).or_default();
        window.push_back(now);
        let window_ms = self.cfg.window_ms;
        while window
            .front()
            .is_some_and(|t| millis_since(*t, now) >= window_ms)
        {
            window.pop_front();
        }

        inner
            .recent_content
            .insert((user_id, content.to_string()), now);

        if let Some(group_id) = group_id {
            inner.group_last_response.insert(group_id, now);
        }
    }

    /// Drop expired window entries, dedup keys, and group cooldowns.
    pub fn cleanup(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        let window_ms = self.cfg.window_ms;
        let dedup_ms = self.cfg.dedup_window_ms;
        let cooldown_ms = self.cfg.group_cooldown_ms;

        inner.user_windows.retain(|_, window| {
            while window
                .front()
                .is_some_and(|t| millis_since(*t, now) >= window_ms)
            {
                window.pop_front();
            }
            !window.is_empty()
        });
        inner
            .recent_content
            .retain(|_, t| millis_since(*t, now) < dedup_ms);
        inner
            .group_last_response
            .retain(|_, t| millis_since(*t, now) < cooldown_ms);
    }

    /// Periodic cleanup so idle users and groups don't accumulate forever.
    pub fn spawn_cleanup(&self) {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                limiter.cleanup();
            }
        });
    }
}

fn millis_since(earlier: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - earlier).num_milliseconds().max(0) as u64
}
