//! Payload flattening, previews, and header filtering.
//!
//! All three interception points reduce structured payloads to the same
//! shape: a deterministic list of `(dotted.path, leaf value)` pairs. Nested
//! maps produce `parent.child` paths, lists produce `parent.index` paths,
//! and list order is preserved.

use serde_json::Value;

/// Headers that must never be captured, regardless of the allow-list.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "x-audit-token",
];

/// Flatten a JSON value into dotted-path leaves.
///
/// A scalar at the top level yields a single entry with an empty path.
pub fn flatten_value(value: &Value) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    flatten_into("", value, &mut out);
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let path = join_path(prefix, key);
                flatten_into(&path, nested, out);
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                let path = join_path(prefix, &index.to_string());
                flatten_into(&path, nested, out);
            }
        }
        leaf => out.push((prefix.to_string(), leaf.clone())),
    }
}

fn join_path(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}.{segment}")
    }
}

/// Final segment of a dotted path (`"user.email"` -> `"email"`).
pub fn leaf_segment(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

/// Truncated, log-safe preview of a value. Strings render without quotes;
/// everything else renders as compact JSON. Truncation is by characters, not
/// bytes, so multi-byte input cannot panic.
pub fn preview_value(value: &Value, max_len: usize) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    preview_text(&text, max_len)
}

/// Truncate a string to `max_len` characters with an ellipsis marker.
pub fn preview_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_len.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// True if a value counts as present for tagging purposes. Null and empty
/// strings are skipped at ingress.
pub fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

/// Filter outbound headers down to the capturable subset: lowercase `x-*`
/// extension headers minus the sensitive deny-set. Authorization and other
/// secret-bearing headers are never captured.
pub fn capturable_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            lower.starts_with("x-") && !SENSITIVE_HEADERS.contains(&lower.as_str())
        })
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect()
}
