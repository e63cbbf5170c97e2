//! Response clean-up for agent answers.
//!
//! The upstream agent sometimes opens an answer with a canned greeting before
//! getting to the point. Those openers are stripped here; if nothing useful is
//! left, a generic prompt asking for more detail is returned instead.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

/// Returned when the agent's answer is empty once the greeting is removed.
pub const GENERIC_PROMPT: &str = "I'm here to help with your legal questions. \
     Could you please provide more details about what you'd like to know?";

/// Answers shorter than this (in characters) are replaced by [`GENERIC_PROMPT`].
pub const MIN_RESPONSE_CHARS: usize = 10;

/// Greeting patterns, applied in order. Each one runs against the output of
/// the previous one whether or not that one matched.
static GREETING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^\s*(?:hello|hi|hey|greetings)(?:\s+there)?[!,.]*\s*i(?:'m|’m| am)\s+(?:your|a|an|the)?\s*(?:friendly\s+)?(?:legal\s+)?(?:ai\s+)?assistant\b[^.!?\n]*[.!?]*\s*",
        r"(?i)^\s*(?:welcome to|thank you for (?:reaching out|contacting))[^.!?\n]*[.!?]+\s*",
        r"(?i)^\s*i(?:'m|’m| am) here to help(?: you)? with (?:your |any )?legal (?:questions|matters|needs)[^.!?\n]*[.!?]*\s*",
        r"(?i)^\s*how (?:can|may) i (?:help|assist) you(?: today)?[?.!]*\s*",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex is valid"))
    .collect()
});

/// Strip boilerplate greetings from an agent answer and trim it.
pub fn sanitize_response(raw: &str) -> String {
    let mut text = raw.to_string();
    for pattern in GREETING_PATTERNS.iter() {
        text = pattern.replace(&text, "").into_owned();
    }

    let trimmed = text.trim();
    if trimmed.chars().count() < MIN_RESPONSE_CHARS {
        debug!(raw_len = raw.len(), "Agent answer empty after clean-up, using generic prompt");
        return GENERIC_PROMPT.to_string();
    }
    trimmed.to_string()
}
