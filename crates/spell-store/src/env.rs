// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment-derived runtime limits.
//!
//! The engine reads its knobs from `SPELL_RUNTIME_*` variables once per
//! cast; defaults match the documented contract.

use anyhow::{Context, Result};

/// Default cap on the canonical input JSON byte size (64 KiB).
pub const DEFAULT_INPUT_MAX_BYTES: usize = 64 * 1024;
/// Default per-step timeout.
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 60_000;

/// Engine limits resolved from the process environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeLimits {
    /// `SPELL_RUNTIME_INPUT_MAX_BYTES` (default 64 KiB).
    pub input_max_bytes: usize,
    /// `SPELL_RUNTIME_STEP_TIMEOUT_MS` (default 60 000).
    pub step_timeout_ms: u64,
    /// `SPELL_RUNTIME_EXECUTION_TIMEOUT_MS`; `None` when unset or `0`.
    pub execution_timeout_ms: Option<u64>,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            input_max_bytes: DEFAULT_INPUT_MAX_BYTES,
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            execution_timeout_ms: None,
        }
    }
}

impl RuntimeLimits {
    /// Read limits from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut limits = Self::default();
        if let Some(v) = parse_var::<usize>("SPELL_RUNTIME_INPUT_MAX_BYTES")? {
            limits.input_max_bytes = v;
        }
        if let Some(v) = parse_var::<u64>("SPELL_RUNTIME_STEP_TIMEOUT_MS")? {
            limits.step_timeout_ms = v;
        }
        if let Some(v) = parse_var::<u64>("SPELL_RUNTIME_EXECUTION_TIMEOUT_MS")? {
            limits.execution_timeout_ms = (v > 0).then_some(v);
        }
        Ok(limits)
    }
}

/// Parse an optional numeric env var, erroring on garbage rather than
/// silently ignoring it.
pub fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => {
            let parsed = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("{name} is not a valid number: '{raw}'"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}
