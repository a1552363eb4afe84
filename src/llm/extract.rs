/// Recover structured data from free-form model text.
///
/// JSON is tried first, from the most explicit location to the most
/// heuristic one; legacy `Click(x, y)` text is handled by the regex helpers.
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn json_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)```json\s*(.*?)```").expect("valid regex"))
}

fn any_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```\s*(.*?)```").expect("valid regex"))
}

/// Candidate snippets in priority order: ```json fence, any fence, the whole
/// text, then text from the first `{` and from the first `[`.
fn candidates(text: &str) -> Vec<&str> {
    let mut out = Vec::with_capacity(5);
    if let Some(c) = json_fence().captures(text).and_then(|c| c.get(1)) {
        out.push(c.as_str());
    }
    if let Some(c) = any_fence().captures(text).and_then(|c| c.get(1)) {
        out.push(c.as_str());
    }
    let stripped = text.trim();
    if !stripped.is_empty() {
        out.push(stripped);
    }
    // Whichever opener comes first is tried first, so `[{..}, {..}]` is not
    // truncated to its first object.
    let mut openers: Vec<usize> = ['{', '['].iter().filter_map(|&t| text.find(t)).collect();
    openers.sort_unstable();
    for idx in openers {
        out.push(&text[idx..]);
    }
    out
}

/// Strict parse, then a prefix decode that ignores trailing content.
fn decode(snippet: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(snippet) {
        return Some(v);
    }
    serde_json::Deserializer::from_str(snippet)
        .into_iter::<Value>()
        .next()
        .and_then(Result::ok)
}

/// Extract the first JSON object or array found in `text`.
///
/// A `Some` result is only structurally JSON; it may still be `{}` or hold
/// no usable elements.
pub fn extract_json(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    for candidate in candidates(text) {
        let snippet = candidate.trim();
        if snippet.is_empty() {
            continue;
        }
        match decode(snippet) {
            Some(v @ (Value::Object(_) | Value::Array(_))) => return Some(v),
            // Bare scalars ("42", "true") are not answers.
            Some(_) | None => continue,
        }
    }
    None
}

fn coordinate_patterns() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [
            r"(?i)Click\((\d+),\s*(\d+)\)",
            r"\((\d+),\s*(\d+)\)",
            r"(?i)x[:\s]*(\d+)[,\s]+y[:\s]*(\d+)",
            r"(\d+)[,\s]+(\d+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
    })
}

fn description_patterns() -> &'static [Regex] {
    static RE: OnceLock<Vec<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        [
            r"(?i)Click\(\d+,\s*\d+\)\s*[-–—:]\s*([^\n]+)",
            r"\(\d+,\s*\d+\)\s*[-–—:]\s*([^\n]+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
    })
}

/// Parse a legacy point answer such as `Click(352, 348)` or `x: 10, y: 20`.
pub fn parse_coordinates(text: &str) -> Option<(f64, f64)> {
    for re in coordinate_patterns() {
        let Some(caps) = re.captures(text) else { continue };
        let x = caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok());
        let y = caps.get(2).and_then(|m| m.as_str().parse::<u64>().ok());
        if let (Some(x), Some(y)) = (x, y) {
            return Some((x as f64, y as f64));
        }
    }
    None
}

/// Description following the coordinates, e.g. `Click(1, 2) - Save button.`
pub fn parse_description(text: &str) -> Option<String> {
    for re in description_patterns() {
        if let Some(caps) = re.captures(text) {
            let desc = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let desc = desc.strip_suffix('.').unwrap_or(desc).trim();
            return if desc.is_empty() { None } else { Some(desc.to_string()) };
        }
    }
    None
}
