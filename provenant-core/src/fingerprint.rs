//! Deterministic content fingerprinting.
//!
//! A fingerprint is the matching key for everything in this engine: the same
//! logical value must hash identically whether it arrives in a signup form,
//! a model column, or a JSON body three requests later. Canonical form is
//! JSON with map keys sorted and consistent scalar formatting; the digest is
//! SHA-256 truncated to 32 hex characters.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Number of hex characters retained from the SHA-256 digest.
const FINGERPRINT_LEN: usize = 32;

/// Fingerprint a JSON value. Pure; key order and container type of the
/// caller's original data never affect the result.
pub fn fingerprint_value(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    hash_truncated(canonical.as_bytes())
}

/// Fingerprint any serializable value.
///
/// Values that fail JSON conversion degrade to a fallback string form before
/// hashing rather than surfacing an error to the caller.
pub fn fingerprint_serializable<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(v) => fingerprint_value(&v),
        Err(e) => hash_truncated(format!("unserializable:{e}").as_bytes()),
    }
}

/// Fingerprint a plain string. Equivalent to fingerprinting
/// `Value::String`, so a string matches itself wherever it reappears.
pub fn fingerprint_text(text: &str) -> String {
    fingerprint_value(&Value::String(text.to_string()))
}

fn hash_truncated(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(FINGERPRINT_LEN);
    for byte in digest.iter().take(FINGERPRINT_LEN / 2) {
        // 2 hex chars per byte
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Serialize a value into canonical form: object keys sorted, compact
/// separators, scalars rendered through serde_json's own formatting.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys are JSON-escaped exactly like string values.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
