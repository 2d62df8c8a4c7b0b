// SPDX-License-Identifier: MIT OR Apache-2.0
//! Output reference resolution.
//!
//! Step outputs are published under `step.<name>.stdout` (shell) and
//! `step.<name>.json` (http). References may walk into a parsed json body
//! with a dotted suffix; stdout references are opaque strings.

use crate::values::get_path;
use serde_json::{Map, Value};
use thiserror::Error;

/// Failure while resolving an output reference.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutputRefError {
    /// The referenced output key does not exist.
    #[error("output reference not found: {reference}")]
    NotFound {
        /// The reference as written.
        reference: String,
    },
    /// A dotted suffix was applied to a `.stdout` reference.
    #[error("stdout reference does not support nested path: {reference}")]
    NestedStdout {
        /// The reference as written.
        reference: String,
    },
    /// The reference does not match `step.<name>.stdout|json[...]`.
    #[error("invalid output reference: {reference}")]
    Invalid {
        /// The reference as written.
        reference: String,
    },
}

/// Resolve `reference` against the outputs map produced by the scheduler.
///
/// `step.<name>.stdout` returns the raw captured string;
/// `step.<name>.json` returns the parsed body, and a dotted suffix walks
/// into it. Missing keys and missing nested paths both surface as
/// [`OutputRefError::NotFound`], which the condition evaluator treats as a
/// skip rather than an error.
pub fn resolve_output_reference(
    outputs: &Map<String, Value>,
    reference: &str,
) -> Result<Value, OutputRefError> {
    let not_found = || OutputRefError::NotFound {
        reference: reference.to_string(),
    };

    let rest = reference.strip_prefix("step.").ok_or_else(|| {
        OutputRefError::Invalid {
            reference: reference.to_string(),
        }
    })?;
    let (name, kind_path) = rest.split_once('.').ok_or_else(|| OutputRefError::Invalid {
        reference: reference.to_string(),
    })?;

    if kind_path == "stdout" {
        let key = format!("step.{name}.stdout");
        return outputs.get(&key).cloned().ok_or_else(not_found);
    }
    if let Some(suffix) = kind_path.strip_prefix("stdout.") {
        let _ = suffix;
        return Err(OutputRefError::NestedStdout {
            reference: reference.to_string(),
        });
    }

    if kind_path == "json" || kind_path.starts_with("json.") {
        let key = format!("step.{name}.json");
        let body = outputs.get(&key).ok_or_else(not_found)?;
        let path = kind_path.strip_prefix("json").unwrap_or("");
        let path = path.strip_prefix('.').unwrap_or(path);
        return get_path(body, path).cloned().ok_or_else(not_found);
    }

    Err(OutputRefError::Invalid {
        reference: reference.to_string(),
    })
}
