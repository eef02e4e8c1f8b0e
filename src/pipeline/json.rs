//! Lenient extraction of a JSON object from model output.
//!
//! Models wrap JSON in code fences or surround it with prose; we strip the
//! fences and take the outermost `{ ... }` span before deserializing.

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").ok())
        .as_ref()
}

/// Best-effort isolation of the JSON object in `raw`.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let body = fence_regex()
        .and_then(|re| re.captures(raw))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw);

    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (end > start).then(|| &body[start..=end])
}

/// Parse the JSON object embedded in `raw` as `T`.
pub fn parse_json_object<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    let object = extract_json_object(raw)
        .ok_or_else(|| format!("no JSON object in output: {}", snippet(raw)))?;
    serde_json::from_str(object).map_err(|e| format!("invalid JSON ({}): {}", e, snippet(object)))
}

fn snippet(text: &str) -> String {
    crate::task::types::preview(text.trim(), 120)
}
