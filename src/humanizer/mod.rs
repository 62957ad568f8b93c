//! The humanizer suite: background analyzers and gating heuristics that make
//! the bot's participation feel like a person's.
//!
//! Everything here is advisory or fire-and-forget; failures are logged and
//! swallowed so the dispatcher never stalls on an analyzer.

mod emoji;
mod expressions;
mod frequency;
mod memory;
mod planner;
mod topics;
mod typo;

pub use emoji::EmojiSystem;
pub use expressions::ExpressionLearner;
pub use frequency::FrequencyController;
pub use memory::MemoryRetrieval;
pub use planner::{ActionPlanner, PlanDecision, PlannedAction};
pub use topics::TopicTracker;
pub use typo::humanize_typos;

use once_cell::sync::Lazy;
use regex::Regex;

/// Extract the first balanced `{…}` object from model output. Models wrap
/// JSON in prose and code fences often enough that plain `from_str` on the
/// whole response is a losing strategy.
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*([}\]])").unwrap());

/// Parse a JSON object out of model output, retrying once with trailing
/// commas stripped.
pub(crate) fn parse_lenient_json(text: &str) -> Option<serde_json::Value> {
    let candidate = extract_json_object(text)?;
    if let Ok(value) = serde_json::from_str(candidate) {
        return Some(value);
    }
    let repaired = TRAILING_COMMA.replace_all(candidate, "$1");
    serde_json::from_str(repaired.as_ref()).ok()
}
