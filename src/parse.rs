//! Recovery of structured payloads from free-form model responses.
//!
//! Models are asked to answer in JSON but frequently wrap it in prose or
//! markdown fences. [`parse_response`] tries a fixed sequence of
//! strategies and returns the first value that parses:
//!
//! 1. the whole trimmed response;
//! 2. each ```` ```json ```` fenced block, in order of appearance;
//! 3. the span from the first `{` to the last `}`.
//!
//! A failed attempt never affects the next one, and nothing here returns
//! an error: an unparseable response is simply `None`.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn json_fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"```json\s*([\s\S]*?)\s*```").expect("valid fence regex"))
}

/// Recover a JSON value from a model response, or `None`.
pub fn parse_response(text: &str) -> Option<Value> {
    let stripped = text.trim();

    parse_whole(stripped)
        .or_else(|| parse_fenced(stripped))
        .or_else(|| parse_brace_span(stripped))
}

fn parse_whole(text: &str) -> Option<Value> {
    serde_json::from_str(text).ok()
}

fn parse_fenced(text: &str) -> Option<Value> {
    json_fence()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .find_map(|m| serde_json::from_str(m.as_str()).ok())
}

/// Extract the outermost `{ ... }` fragment.
fn parse_brace_span(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
