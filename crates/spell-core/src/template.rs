// SPDX-License-Identifier: MIT OR Apache-2.0
//! Placeholder templating for http request specs and check inputs.
//!
//! Placeholders take the form `{{INPUT.a.b.c}}` or `{{ENV.NAME}}`. A string
//! that consists of exactly one placeholder keeps the substituted value's
//! native JSON type; any other occurrence is stringified in place.

use crate::values::get_path;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Substitution sources for [`apply_template`].
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// The resolved cast input object.
    pub input: Value,
    /// Ambient environment variables visible to the bundle.
    pub env: BTreeMap<String, String>,
}

/// Failure while expanding a template.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// A placeholder referenced a value that does not exist.
    #[error("unresolved template: {placeholder}")]
    Unresolved {
        /// The full `{{…}}` placeholder text.
        placeholder: String,
    },
}

/// Recursively expand every placeholder in `value`.
pub fn apply_template(value: &Value, ctx: &TemplateContext) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => expand_string(s, ctx),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(apply_template(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), apply_template(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn expand_string(s: &str, ctx: &TemplateContext) -> Result<Value, TemplateError> {
    // Whole-string placeholder keeps the native type.
    if let Some(expr) = whole_placeholder(s) {
        return resolve(expr, ctx).ok_or_else(|| TemplateError::Unresolved {
            placeholder: format!("{{{{{expr}}}}}"),
        });
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // No closing braces: leave the remainder untouched.
            out.push_str(&rest[start..]);
            return Ok(Value::String(out));
        };
        let expr = after[..end].trim();
        let resolved = resolve(expr, ctx).ok_or_else(|| TemplateError::Unresolved {
            placeholder: format!("{{{{{expr}}}}}"),
        })?;
        out.push_str(&stringify(&resolved));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    let inner = inner.trim();
    // Reject strings that contain a second placeholder.
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

fn resolve(expr: &str, ctx: &TemplateContext) -> Option<Value> {
    if let Some(path) = expr.strip_prefix("INPUT.") {
        return get_path(&ctx.input, path).cloned();
    }
    if expr == "INPUT" {
        return Some(ctx.input.clone());
    }
    if let Some(name) = expr.strip_prefix("ENV.") {
        return ctx.env.get(name).map(|v| Value::String(v.clone()));
    }
    None
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
