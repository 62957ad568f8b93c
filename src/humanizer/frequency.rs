//! Speak-frequency control: decides whether the bot talks at all, and how
//! long it pretends to type.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use tracing::debug;

use crate::config::FrequencyConfig;

#[derive(Default)]
struct SpeakState {
    last_speak: Option<DateTime<Utc>>,
    consecutive_no_reply: u32,
}

pub struct FrequencyController {
    cfg: FrequencyConfig,
    state: Mutex<HashMap<String, SpeakState>>,
}

impl FrequencyController {
    pub fn new(cfg: FrequencyConfig) -> Self {
        Self {
            cfg,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Gate a reply for this session. A failed draw increments the
    /// consecutive-no-reply counter, which boosts later draws so the bot
    /// never goes fully silent.
    pub fn should_speak(&self, session_id: &str) -> bool {
        if !self.cfg.enabled {
            return true;
        }

        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(session_id.to_string()).or_default();

        if let Some(last) = entry.last_speak {
            let since_ms = (now - last).num_milliseconds().max(0) as u64;
            if since_ms < self.cfg.min_interval_ms {
                debug!(session_id, since_ms, "frequency: inside min interval");
                return false;
            }
        }

        let mut p = self.cfg.speak_probability.clamp(0.0, 1.0);
        if in_quiet_hours(
            now.hour(),
            self.cfg.quiet_hours_start,
            self.cfg.quiet_hours_end,
        ) {
            p *= self.cfg.quiet_probability_multiplier.clamp(0.0, 1.0);
        }
        if entry.consecutive_no_reply >= 3 {
            p = (p + 0.2 * (entry.consecutive_no_reply as f32 - 2.0)).min(1.0);
        }

        let speak = rand::thread_rng().gen::<f32>() < p;
        if !speak {
            entry.consecutive_no_reply += 1;
            debug!(
                session_id,
                probability = p,
                no_reply = entry.consecutive_no_reply,
                "frequency: staying quiet"
            );
        }
        speak
    }

    /// Mark that the bot spoke: resets the silence counter and starts the
    /// min-interval clock.
    pub fn record_speak(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(session_id.to_string()).or_default();
        entry.last_speak = Some(Utc::now());
        entry.consecutive_no_reply = 0;
    }

    /// Simulated typing time for a reply of `len` characters.
    pub fn typing_delay(&self, len: usize) -> Duration {
        let mut rng = rand::thread_rng();
        let base = rng.gen_range(1000..=3000u64);
        let per_char = rng.gen_range(50..=100u64);
        let ms = (base + len as u64 * per_char).min(self.cfg.max_interval_ms);
        Duration::from_millis(ms)
    }
}

/// Whether `hour` falls in `[start, end)`, wrapping past midnight.
/// `start == end` means the window is empty.
fn in_quiet_hours(hour: u32, start: u32, end: u32) -> bool {
    let (start, end) = (start % 24, end % 24);
    if start == end {
        return false;
    }
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}
