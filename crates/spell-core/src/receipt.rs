// SPDX-License-Identifier: MIT OR Apache-2.0
//! Execution receipts.
//!
//! A receipt is the durable JSON record of one cast: redacted input, step
//! and check results, outputs, signature summary, and (on failure) the
//! rollback summary. Receipts are append-only files; nothing mutates them
//! after the engine writes them.

use crate::manifest::{Billing, RiskLevel, RuntimeSpec};
use crate::redact::redact_value;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum characters captured in `stdout_head` / `stderr_head`.
pub const HEAD_MAX_CHARS: usize = 200;

/// Outcome of signature verification for the cast bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SignatureStatus {
    /// Verification was not attempted (e.g. `--allow-unsigned`).
    Skipped,
    /// Digest recomputed and signature verified against a trusted key.
    Verified,
    /// No `spell.sig.json` present.
    Unsigned,
    /// Publisher or key is not in the trust store.
    Untrusted,
    /// Signature present but wrong: digest mismatch, revoked key, or
    /// cryptographic failure.
    Invalid,
}

/// Signature verification summary embedded in the receipt.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SignatureSummary {
    /// Whether the caller demanded a verified signature.
    pub required: bool,
    /// Verification outcome.
    pub status: SignatureStatus,
    /// Publisher named by the signature file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// Key id named by the signature file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Hex digest the signature covers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Diagnostic for non-verified outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SignatureSummary {
    /// A `skipped` summary for dry runs and `--allow-unsigned` casts.
    #[must_use]
    pub fn skipped(required: bool) -> Self {
        Self {
            required,
            status: SignatureStatus::Skipped,
            publisher: None,
            key_id: None,
            digest: None,
            message: None,
        }
    }
}

/// Result of one step (or one synthetic rollback step).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepResult {
    /// Step name; rollback steps are named `rollback.<original>`.
    #[serde(rename = "stepName")]
    pub step_name: String,
    /// Executor used (`shell` / `http`).
    pub uses: String,
    /// When the attempt series started.
    pub started_at: DateTime<Utc>,
    /// When the step settled.
    pub finished_at: DateTime<Utc>,
    /// Whether the step succeeded (condition skips count as success).
    pub success: bool,
    /// Process exit code for shell steps.
    #[serde(rename = "exitCode", default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// First [`HEAD_MAX_CHARS`] characters of stdout. Stripped from API
    /// receipts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_head: Option<String>,
    /// First [`HEAD_MAX_CHARS`] characters of stderr. Stripped from API
    /// receipts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_head: Option<String>,
    /// Human-readable status line.
    pub message: String,
}

/// Truncate captured output to [`HEAD_MAX_CHARS`] characters.
#[must_use]
pub fn truncate_head(text: &str) -> String {
    text.chars().take(HEAD_MAX_CHARS).collect()
}

/// Classification of how far compensation got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RollbackState {
    /// Nothing had executed when the failure occurred.
    NotNeeded,
    /// Every executed step with a handler rolled back, none lacked one.
    FullyCompensated,
    /// At least one rollback succeeded.
    PartiallyCompensated,
    /// No rollback succeeded.
    NotCompensated,
}

/// Compensation accounting attached to failed receipts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RollbackSummary {
    /// Steps that had actually executed before the failure.
    pub total_executed: usize,
    /// Executed steps that declared a rollback handler.
    pub rollback_planned: usize,
    /// Rollback handlers that were launched.
    pub rollback_attempted: usize,
    /// Rollback handlers that succeeded.
    pub rollback_succeeded: usize,
    /// Rollback handlers that failed (including deadline expiry).
    pub rollback_failed: usize,
    /// Executed steps without a handler.
    pub rollback_skipped_without_handler: usize,
    /// Names of steps whose rollback failed.
    #[serde(default)]
    pub failed_steps: Vec<String>,
    /// Overall classification.
    pub state: RollbackState,
    /// Set when policy demands full compensation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_full_compensation: Option<bool>,
    /// Set when a partial outcome was escalated to manual recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_recovery_required: Option<bool>,
}

/// Result of one declared check.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CheckResult {
    /// Check name from the manifest.
    pub name: String,
    /// Whether the check passed.
    pub passed: bool,
    /// Failure detail, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// License summary embedded in the receipt.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LicenseSummary {
    /// Whether a matching active license authorized the billing gate.
    pub licensed: bool,
    /// Name of the license record that matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Manifest facts echoed into the receipt for auditability.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReceiptSummary {
    /// Declared risk level.
    pub risk: RiskLevel,
    /// Billing declaration as cast.
    pub billing: Billing,
    /// Runtime declaration as cast.
    pub runtime: RuntimeSpec,
    /// License that satisfied the billing gate, when billing was enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<LicenseSummary>,
}

/// The durable record of one cast.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Receipt {
    /// Stable execution identifier (also the receipt file stem).
    pub execution_id: String,
    /// Spell id.
    pub id: String,
    /// Spell version.
    pub version: String,
    /// When the cast started.
    pub started_at: DateTime<Utc>,
    /// When the cast finished (or aborted).
    pub finished_at: DateTime<Utc>,
    /// Resolved input, redacted before persistence.
    pub input: Value,
    /// Manifest facts.
    pub summary: ReceiptSummary,
    /// Signature verification summary.
    pub signature: SignatureSummary,
    /// Step results in completion order, rollback steps included.
    pub steps: Vec<StepResult>,
    /// Published outputs (`step.<name>.stdout` / `step.<name>.json`).
    pub outputs: Map<String, Value>,
    /// Check results.
    pub checks: Vec<CheckResult>,
    /// Compensation accounting; absent on success and dry runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackSummary>,
    /// Overall outcome.
    pub success: bool,
    /// Single-line failure cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Receipt {
    /// Serialize with redaction applied: sensitive keys and known secret
    /// values never reach disk.
    pub fn to_redacted_json(&self, secrets: &[String]) -> Result<Value, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        redact_value(&mut value, secrets);
        Ok(value)
    }
}

/// Build a stable execution id from identity and wall-clock time:
/// `YYYYMMDDTHHMMSSZ_<sanitized id>_<sanitized version>`.
#[must_use]
pub fn execution_id(id: &str, version: &str, now: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        now.format("%Y%m%dT%H%M%SZ"),
        sanitize_component(id),
        sanitize_component(version)
    )
}

fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn execution_id_format() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let id = execution_id("acme/hello", "1.0.0", now);
        assert_eq!(id, "20250314T092653Z_acme-hello_1.0.0");
    }

    #[test]
    fn head_truncation_caps_at_200_chars() {
        let long = "x".repeat(500);
        assert_eq!(truncate_head(&long).len(), HEAD_MAX_CHARS);
        assert_eq!(truncate_head("short"), "short");
    }

    #[test]
    fn step_result_wire_names() {
        let result = StepResult {
            step_name: "hello".into(),
            uses: "shell".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            success: true,
            exit_code: Some(0),
            stdout_head: Some("hi".into()),
            stderr_head: None,
            message: "ok".into(),
        };
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["stepName"], "hello");
        assert_eq!(v["exitCode"], 0);
        assert!(v.get("stderr_head").is_none());
    }

    #[test]
    fn rollback_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RollbackState::FullyCompensated).unwrap(),
            "\"fully_compensated\""
        );
        assert_eq!(
            serde_json::to_string(&RollbackState::NotNeeded).unwrap(),
            "\"not_needed\""
        );
    }

    #[test]
    fn signature_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SignatureStatus::Untrusted).unwrap(),
            "\"untrusted\""
        );
    }

    #[test]
    fn redacted_json_strips_secrets() {
        let receipt = Receipt {
            execution_id: "e1".into(),
            id: "acme/hello".into(),
            version: "1.0.0".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            input: json!({"api_token": "abcd1234", "name": "world"}),
            summary: ReceiptSummary {
                risk: RiskLevel::Low,
                billing: Billing::default(),
                runtime: RuntimeSpec::default(),
                license: None,
            },
            signature: SignatureSummary::skipped(false),
            steps: vec![],
            outputs: Map::new(),
            checks: vec![],
            rollback: None,
            success: true,
            error: None,
        };
        let v = receipt.to_redacted_json(&["abcd1234".to_string()]).unwrap();
        assert_eq!(v["input"]["api_token"], json!("[REDACTED]"));
        assert_eq!(v["input"]["name"], json!("world"));
    }
}
