// SPDX-License-Identifier: MIT OR Apache-2.0
//! Post-execution check evaluation.

use serde_json::{Map, Value};
use spell_core::Check;
use spell_core::outputs::resolve_output_reference;
use spell_core::receipt::CheckResult;

/// Evaluate every declared check against the outputs map.
#[must_use]
pub fn evaluate_checks(checks: &[Check], outputs: &Map<String, Value>) -> Vec<CheckResult> {
    checks.iter().map(|check| evaluate(check, outputs)).collect()
}

fn evaluate(check: &Check, outputs: &Map<String, Value>) -> CheckResult {
    let value = match resolve_output_reference(outputs, &check.output) {
        Ok(v) => v,
        Err(e) => {
            return CheckResult {
                name: check.name.clone(),
                passed: false,
                message: Some(e.to_string()),
            };
        }
    };

    let (passed, message) = if let Some(expected) = &check.equals {
        let ok = &value == expected;
        (
            ok,
            (!ok).then(|| format!("expected {expected}, got {value}")),
        )
    } else if let Some(unexpected) = &check.not_equals {
        let ok = &value != unexpected;
        (ok, (!ok).then(|| format!("value equals {unexpected}")))
    } else if let Some(needle) = &check.contains {
        match value.as_str() {
            Some(s) => {
                let ok = s.contains(needle.as_str());
                (ok, (!ok).then(|| format!("'{needle}' not found in output")))
            }
            None => (
                false,
                Some("contains check requires a string output".to_string()),
            ),
        }
    } else {
        // Manifest validation requires exactly one matcher.
        (true, None)
    };

    CheckResult {
        name: check.name.clone(),
        passed,
        message,
    }
}
