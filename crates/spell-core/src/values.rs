// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dot-path helpers over [`serde_json::Value`].
//!
//! Inputs, step outputs, and entitlement claims are all dynamic JSON
//! values; these helpers give the rest of the runtime a single way to walk
//! and build them.

use serde_json::{Map, Value};

/// Walk `value` along a `.`-separated path, returning the node if present.
///
/// An empty path returns the value itself. Only object keys are walked;
/// arrays are not indexable through a dot path.
#[must_use]
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut cur = value;
    for seg in path.split('.') {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

/// Set `path` inside `value` to `new`, creating intermediate objects.
///
/// Non-object intermediate nodes are replaced by objects, matching the
/// behaviour of `--param a.b=c` layering over `--input` JSON.
pub fn set_path(value: &mut Value, path: &str, new: Value) {
    if path.is_empty() {
        *value = new;
        return;
    }
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    let mut cur = value;
    let segs: Vec<&str> = path.split('.').collect();
    for (i, seg) in segs.iter().enumerate() {
        let map = cur.as_object_mut().expect("intermediate node is an object");
        if i == segs.len() - 1 {
            map.insert((*seg).to_string(), new);
            return;
        }
        let entry = map
            .entry((*seg).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        cur = entry;
    }
}

/// Parse a CLI `key=value` scalar: JSON when it parses, string otherwise.
///
/// `-p count=3` yields a number, `-p debug=true` a bool, and
/// `-p name=world` a plain string.
#[must_use]
pub fn parse_scalar(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
