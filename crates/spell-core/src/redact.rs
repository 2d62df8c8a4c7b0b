// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sensitive-value redaction applied to receipts before serialization.
//!
//! Two passes over the receipt JSON: string values under a sensitive key
//! are replaced wholesale, and free-form strings have any occurrence of a
//! sensitive environment value substituted out.

use serde_json::Value;

/// Replacement marker for redacted content.
pub const REDACTED: &str = "[REDACTED]";

/// Returns `true` when a field name matches the sensitive-key pattern
/// (`token|secret|password|authorization|api[_-]?key`, case-insensitive).
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    k.contains("token")
        || k.contains("secret")
        || k.contains("password")
        || k.contains("authorization")
        || k.contains("api_key")
        || k.contains("api-key")
        || k.contains("apikey")
}

/// Collect the values of process env vars whose *names* are sensitive.
///
/// Empty and very short values are skipped so that substring scrubbing
/// cannot mangle unrelated text.
#[must_use]
pub fn sensitive_env_values<I>(env: I) -> Vec<String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut values: Vec<String> = env
        .into_iter()
        .filter(|(name, value)| is_sensitive_key(name) && value.len() >= 4)
        .map(|(_, value)| value)
        .collect();
    // Longest first so overlapping secrets scrub deterministically.
    values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    values.dedup();
    values
}

/// Redact `value` in place: sensitive keys lose their string values, and
/// every string has known secret substrings replaced.
pub fn redact_value(value: &mut Value, secrets: &[String]) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if is_sensitive_key(key) && v.is_string() {
                    *v = Value::String(REDACTED.to_string());
                } else {
                    redact_value(v, secrets);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item, secrets);
            }
        }
        Value::String(s) => {
            for secret in secrets {
                if s.contains(secret.as_str()) {
                    *s = s.replace(secret.as_str(), REDACTED);
                }
            }
        }
        _ => {}
    }
}
