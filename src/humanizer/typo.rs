//! Typo generator: small, plausible slips applied to outbound lines.
//!
//! Two passes. First, with probability `word_replace_rate`, the earliest
//! matching casual-phrase rewrite is applied. Then every codepoint rolls
//! `error_rate` to be swapped for a homophone from a built-in table keyed on
//! single CJK characters.

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

use crate::config::TypoConfig;

/// Ordered casual-phrase rewrites; only the first match fires.
static CASUAL_PHRASES: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"知道了", "知道啦"),
        (r"好的", "好叭"),
        (r"什么", "啥"),
        (r"怎么", "咋"),
        (r"不是吧", "不会吧"),
        (r"哈哈", "哈哈哈哈"),
        (r"这样子", "酱紫"),
        (r"谢谢", "蟹蟹"),
        (r"(?i)\bokay\b", "okk"),
        (r"(?i)\bthanks\b", "thx"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).unwrap(), replacement))
    .collect()
});

/// Homophones and near-homophones for common single characters.
static HOMOPHONES: &[(char, &[char])] = &[
    ('的', &['得', '地']),
    ('在', &['再']),
    ('再', &['在']),
    ('吗', &['嘛', '麻']),
    ('吧', &['叭', '八']),
    ('啊', &['阿', '呀']),
    ('了', &['叻', '勒']),
    ('是', &['事', '士']),
    ('做', &['作']),
    ('那', &['哪']),
    ('哪', &['那']),
    ('他', &['她', '它']),
    ('以', &['已']),
    ('有', &['又']),
    ('和', &['合']),
];

fn homophone_for(c: char, rng: &mut impl Rng) -> Option<char> {
    HOMOPHONES
        .iter()
        .find(|(key, _)| *key == c)
        .map(|(_, subs)| subs[rng.gen_range(0..subs.len())])
}

/// Apply human-looking typos to one outbound line. Identity when disabled.
pub fn humanize_typos(text: &str, cfg: &TypoConfig) -> String {
    if !cfg.enabled {
        return text.to_string();
    }
    let mut rng = rand::thread_rng();
    humanize_with_rng(text, cfg, &mut rng)
}

fn humanize_with_rng(text: &str, cfg: &TypoConfig, rng: &mut impl Rng) -> String {
    let mut out = text.to_string();

    if cfg.word_replace_rate > 0.0 && rng.gen_bool(cfg.word_replace_rate.clamp(0.0, 1.0)) {
        for (pattern, replacement) in CASUAL_PHRASES.iter() {
            if pattern.is_match(&out) {
                out = pattern.replace(&out, *replacement).into_owned();
                break;
            }
        }
    }

    if cfg.error_rate > 0.0 {
        let rate = cfg.error_rate.clamp(0.0, 1.0);
        out = out
            .chars()
            .map(|c| {
                if rng.gen_bool(rate) {
                    homophone_for(c, rng).unwrap_or(c)
                } else {
                    c
                }
            })
            .collect();
    }

    out
}
