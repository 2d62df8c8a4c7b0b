// SPDX-License-Identifier: MIT OR Apache-2.0
//! The cast orchestrator.
//!
//! `cast` runs the full sequence: resolve the installed bundle, build and
//! validate the input, verify the signature, evaluate policy and the
//! risk/billing/permission gates, execute (host scheduler or docker
//! runner), roll back on failure, evaluate checks, and always write a
//! redacted receipt.

use crate::cancel::CancelToken;
use crate::checks::evaluate_checks;
use crate::docker::run_in_docker;
use crate::rollback::run_rollback;
use crate::scheduler::{RunEnv, ScheduleFailure, SchedulerConfig, run_steps};
use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use spell_core::receipt::{
    LicenseSummary, Receipt, ReceiptSummary, RollbackState, RollbackSummary, SignatureStatus,
    SignatureSummary, StepResult, execution_id,
};
use spell_core::redact::sensitive_env_values;
use spell_core::values::{parse_scalar, set_path};
use spell_core::{CheckResult, ErrorCode, ExecutionKind, SpellManifest};
use spell_policy::{PolicyContext, PolicyDocument};
use spell_core::manifest::SCHEMA_FILE;
use spell_store::{RuntimeLimits, SpellHome, SpellStore, atomic_write};
use spell_trust::{LicenseStore, TrustStore, verify_bundle};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// Options for one cast.
#[derive(Debug, Clone)]
pub struct CastOptions {
    /// Slashed spell id.
    pub id: String,
    /// Pinned version; highest installed semver when absent.
    pub version: Option<String>,
    /// Raw `--input` JSON text.
    pub input_json: Option<String>,
    /// `-p key=value` overrides, applied as dot paths over the input.
    pub params: Vec<(String, String)>,
    /// Validate and gate, then write a success receipt without running.
    pub dry_run: bool,
    /// Confirmation for high/critical risk.
    pub yes: bool,
    /// Consent to billing-enabled spells.
    pub allow_billing: bool,
    /// Demand a `verified` signature.
    pub require_signature: bool,
    /// Skip signature verification entirely.
    pub allow_unsigned: bool,
    /// Engine limits, resolved by the caller (usually from the env).
    pub limits: RuntimeLimits,
    /// Pre-allocated execution id (the API server assigns one at
    /// submission time); derived from identity and clock when absent.
    pub execution_id: Option<String>,
}

impl CastOptions {
    /// Options with defaults for `id`, mirroring a bare `spell cast <id>`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
            input_json: None,
            params: Vec::new(),
            dry_run: false,
            yes: false,
            allow_billing: false,
            require_signature: false,
            allow_unsigned: false,
            limits: RuntimeLimits::default(),
            execution_id: None,
        }
    }
}

/// Why a cast did not succeed. Attached to the receipt and the API record.
#[derive(Debug, Clone)]
pub struct CastFailure {
    /// Stable error code; absent for cancellations.
    pub code: Option<ErrorCode>,
    /// Single-line cause.
    pub message: String,
    /// Whether the cast was cancelled rather than failed.
    pub canceled: bool,
}

impl CastFailure {
    fn gate(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
            canceled: false,
        }
    }
}

/// A completed cast: the (redacted) receipt, where it was written, and the
/// failure when there was one.
#[derive(Debug)]
pub struct CastOutcome {
    /// The receipt exactly as persisted.
    pub receipt: Receipt,
    /// Receipt location under `logs/`.
    pub receipt_path: PathBuf,
    /// `None` on success.
    pub failure: Option<CastFailure>,
}

impl CastOutcome {
    /// Whether the cast succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

struct CastState {
    manifest: SpellManifest,
    bundle_path: PathBuf,
    execution_id: String,
    started_at: chrono::DateTime<Utc>,
    input: Value,
    signature: SignatureSummary,
    license: Option<LicenseSummary>,
    steps: Vec<StepResult>,
    outputs: Map<String, Value>,
    checks: Vec<CheckResult>,
    rollback: Option<RollbackSummary>,
}

/// Run one cast end to end. Returns `Err` only when no receipt could be
/// produced at all (unknown spell, unwritable log directory); every other
/// outcome, success or failure, lands in the returned receipt.
pub async fn cast(
    home: &SpellHome,
    options: &CastOptions,
    cancel: &CancelToken,
) -> Result<CastOutcome> {
    let store = SpellStore::new(home.clone());
    let bundle = store.resolve(&options.id, options.version.as_deref())?;
    let started_at = Utc::now();

    let mut state = CastState {
        execution_id: options.execution_id.clone().unwrap_or_else(|| {
            execution_id(&bundle.manifest.id, &bundle.manifest.version, started_at)
        }),
        manifest: bundle.manifest,
        bundle_path: bundle.path,
        started_at,
        input: Value::Object(Map::new()),
        signature: SignatureSummary::skipped(options.require_signature),
        license: None,
        steps: Vec::new(),
        outputs: Map::new(),
        checks: Vec::new(),
        rollback: None,
    };
    info!(
        id = %state.manifest.id,
        version = %state.manifest.version,
        execution_id = %state.execution_id,
        "cast started"
    );

    // Input: --input JSON layered with -p dot-path overrides.
    if let Some(raw) = &options.input_json {
        match serde_json::from_str(raw) {
            Ok(v) => state.input = v,
            Err(e) => {
                let failure =
                    CastFailure::gate(ErrorCode::BadRequest, format!("invalid input JSON: {e}"));
                return finish(home, state, Some(failure));
            }
        }
    }
    for (key, value) in &options.params {
        set_path(&mut state.input, key, parse_scalar(value));
    }
    let canonical = serde_json::to_vec(&state.input).context("serialize input")?;
    if canonical.len() > options.limits.input_max_bytes {
        let failure = CastFailure::gate(
            ErrorCode::BadRequest,
            format!(
                "input exceeds SPELL_RUNTIME_INPUT_MAX_BYTES ({} > {} bytes)",
                canonical.len(),
                options.limits.input_max_bytes
            ),
        );
        return finish(home, state, Some(failure));
    }

    // Schema validation.
    if let Some(failure) = validate_input(&state) {
        return finish(home, state, Some(failure));
    }

    // Signature verification.
    let trust = TrustStore::new(home.clone());
    if !options.allow_unsigned {
        let report = verify_bundle(&state.manifest, &state.bundle_path, &trust);
        state.signature = report.into_summary(options.require_signature);
    }
    if options.require_signature && state.signature.status != SignatureStatus::Verified {
        let code = match state.signature.status {
            SignatureStatus::Untrusted => ErrorCode::SignatureUntrusted,
            SignatureStatus::Invalid => ErrorCode::SignatureInvalid,
            _ => ErrorCode::SignatureRequired,
        };
        let detail = state
            .signature
            .message
            .clone()
            .unwrap_or_else(|| "bundle signature is not verified".to_string());
        let failure = CastFailure::gate(code, format!("signature required: {detail}"));
        return finish(home, state, Some(failure));
    }

    // Policy.
    let policy = PolicyDocument::load(home)?;
    let decision = spell_policy::evaluate(
        &policy,
        &PolicyContext {
            spell_id: &state.manifest.id,
            publisher: state.manifest.publisher(),
            risk: state.manifest.risk,
            execution: state.manifest.runtime.execution,
            effects: &state.manifest.effects,
            signature_status: state.signature.status,
        },
    );
    if !decision.allow {
        let reason = decision.reason.unwrap_or_else(|| "no reason".to_string());
        let failure =
            CastFailure::gate(ErrorCode::PolicyDenied, format!("policy denied: {reason}"));
        return finish(home, state, Some(failure));
    }

    // Platform gate.
    if let Some(message) = platform_mismatch(&state.manifest) {
        return finish(
            home,
            state,
            Some(CastFailure::gate(ErrorCode::PlatformMismatch, message)),
        );
    }

    // Risk gate.
    if state.manifest.risk.needs_confirmation() && !options.yes {
        let risk = serde_json::to_value(state.manifest.risk)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let failure = CastFailure::gate(
            ErrorCode::RiskConfirmationRequired,
            format!("spell risk is {risk}; re-run with --yes to confirm"),
        );
        return finish(home, state, Some(failure));
    }

    // Billing gates.
    if state.manifest.billing.enabled {
        if !options.allow_billing {
            let failure = CastFailure::gate(
                ErrorCode::BillingNotAllowed,
                "billing enabled requires --allow-billing",
            );
            return finish(home, state, Some(failure));
        }
        let licenses = LicenseStore::new(home.clone());
        match licenses.find_matching(&state.manifest.billing, Utc::now())? {
            Some(record) => {
                state.license = Some(LicenseSummary {
                    licensed: true,
                    name: Some(record.name),
                });
            }
            None => {
                let failure = CastFailure::gate(
                    ErrorCode::LicenseRequired,
                    "billing enabled requires matching entitlement token",
                );
                return finish(home, state, Some(failure));
            }
        }
    }

    // Permission gate.
    for permission in &state.manifest.permissions {
        let var = connector_token_var(&permission.connector);
        if std::env::var(&var).map(|v| v.is_empty()).unwrap_or(true) {
            let failure = CastFailure::gate(
                ErrorCode::PermissionMissing,
                format!("missing connector token {var}"),
            );
            return finish(home, state, Some(failure));
        }
    }

    // Dry run: everything above held; record and stop.
    if options.dry_run {
        return finish(home, state, None);
    }

    // Execute.
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let http = reqwest::Client::new();
    let config = SchedulerConfig {
        step_timeout_ms: options.limits.step_timeout_ms,
        execution_timeout_ms: options.limits.execution_timeout_ms,
    };

    let failure = match state.manifest.runtime.execution {
        ExecutionKind::Host => {
            let run_env = RunEnv {
                bundle_root: &state.bundle_path,
                env: &env,
                http: &http,
                cancel,
            };
            let run = run_steps(&state.manifest, &state.input, &run_env, config).await;
            state.steps = run.steps;
            state.outputs = run.outputs;

            match run.failure {
                Some(schedule_failure) => {
                    let input_json = serde_json::to_string(&state.input)?;
                    let (rollback_steps, summary) = run_rollback(
                        &state.manifest,
                        &run.executed,
                        &input_json,
                        &run_env,
                        config,
                        run.deadline,
                    )
                    .await;
                    state.steps.extend(rollback_steps);
                    state.rollback = Some(summary);
                    Some(CastFailure {
                        code: schedule_failure.code(),
                        message: schedule_failure.message().to_string(),
                        canceled: matches!(schedule_failure, ScheduleFailure::Canceled { .. }),
                    })
                }
                None => None,
            }
        }
        ExecutionKind::Docker => {
            match run_in_docker(&state.manifest, &state.bundle_path, &state.input, config, cancel)
                .await
            {
                Ok(response) => {
                    state.steps = response.steps;
                    state.outputs = response.outputs;
                    state.rollback = response.rollback;
                    response.failure.map(|wire| CastFailure {
                        code: wire.code,
                        message: wire.message,
                        canceled: wire.canceled,
                    })
                }
                // The runner never started or died; the receipt still
                // gets written.
                Err(e) => Some(CastFailure {
                    code: Some(ErrorCode::Internal),
                    message: format!("docker runner failed: {e:#}"),
                    canceled: cancel.is_cancelled(),
                }),
            }
        }
    };

    // Checks run only over a complete outputs map.
    let failure = match failure {
        Some(f) => Some(f),
        None => {
            state.checks = evaluate_checks(&state.manifest.checks, &state.outputs);
            state.checks.iter().find(|c| !c.passed).map(|failed| {
                let detail = failed
                    .message
                    .clone()
                    .unwrap_or_else(|| "check did not pass".to_string());
                CastFailure::gate(
                    ErrorCode::StepFailed,
                    format!("check failed: {} ({detail})", failed.name),
                )
            })
        }
    };

    // Rollback-policy escalation.
    let failure = failure.map(|f| escalate_compensation(&policy, &mut state, f));

    finish(home, state, failure)
}

fn escalate_compensation(
    policy: &PolicyDocument,
    state: &mut CastState,
    failure: CastFailure,
) -> CastFailure {
    if failure.canceled || !policy.requires_full_compensation() {
        return failure;
    }
    let Some(summary) = &mut state.rollback else {
        return failure;
    };
    if matches!(
        summary.state,
        RollbackState::FullyCompensated | RollbackState::NotNeeded
    ) {
        return failure;
    }
    summary.require_full_compensation = Some(true);
    summary.manual_recovery_required = Some(true);
    warn!(execution_id = %state.execution_id, "compensation incomplete, manual recovery required");
    CastFailure {
        code: Some(ErrorCode::CompensationIncomplete),
        message: format!("compensation incomplete after failure: {}", failure.message),
        canceled: false,
    }
}

fn validate_input(state: &CastState) -> Option<CastFailure> {
    let schema_path = state.bundle_path.join(SCHEMA_FILE);
    let schema: Value = match std::fs::read(&schema_path)
        .map_err(anyhow::Error::from)
        .and_then(|raw| serde_json::from_slice(&raw).map_err(anyhow::Error::from))
    {
        Ok(v) => v,
        Err(e) => {
            return Some(CastFailure::gate(
                ErrorCode::SchemaValidation,
                format!("bundle schema is unreadable: {e}"),
            ));
        }
    };
    let validator = match jsonschema::validator_for(&schema) {
        Ok(v) => v,
        Err(e) => {
            return Some(CastFailure::gate(
                ErrorCode::SchemaValidation,
                format!("bundle schema does not compile: {e}"),
            ));
        }
    };
    validator.validate(&state.input).err().map(|error| {
        CastFailure::gate(
            ErrorCode::SchemaValidation,
            format!("input schema validation failed: {error}"),
        )
    })
}

/// `CONNECTOR_<UPPER_CONNECTOR>_TOKEN` for a connector name.
#[must_use]
pub fn connector_token_var(connector: &str) -> String {
    let upper: String = connector
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("CONNECTOR_{upper}_TOKEN")
}

fn normalize_arch(arch: &str) -> &str {
    match arch {
        "x86_64" | "x64" | "amd64" => "amd64",
        "aarch64" | "arm64" => "arm64",
        other => other,
    }
}

/// Host platform as `os/arch` with `x64 ≡ amd64` aliasing applied.
#[must_use]
pub fn host_platform() -> String {
    format!(
        "{}/{}",
        std::env::consts::OS,
        normalize_arch(std::env::consts::ARCH)
    )
}

fn platform_mismatch(manifest: &SpellManifest) -> Option<String> {
    let platforms = &manifest.runtime.platforms;
    if platforms.is_empty() {
        return None;
    }
    let host = host_platform();
    let matches = platforms.iter().any(|p| {
        match p.split_once('/') {
            Some((os, arch)) => format!("{os}/{}", normalize_arch(arch)) == host,
            None => false,
        }
    });
    if matches {
        None
    } else {
        Some(format!(
            "platform mismatch: host={host}, spell supports={}",
            platforms.join(", ")
        ))
    }
}

fn finish(
    home: &SpellHome,
    state: CastState,
    failure: Option<CastFailure>,
) -> Result<CastOutcome> {
    let receipt = Receipt {
        execution_id: state.execution_id.clone(),
        id: state.manifest.id.clone(),
        version: state.manifest.version.clone(),
        started_at: state.started_at,
        finished_at: Utc::now(),
        input: state.input,
        summary: ReceiptSummary {
            risk: state.manifest.risk,
            billing: state.manifest.billing.clone(),
            runtime: state.manifest.runtime.clone(),
            license: state.license,
        },
        signature: state.signature,
        steps: state.steps,
        outputs: state.outputs,
        checks: state.checks,
        rollback: state.rollback,
        success: failure.is_none(),
        error: failure.as_ref().map(|f| f.message.clone()),
    };

    let secrets = sensitive_env_values(std::env::vars());
    let redacted = receipt
        .to_redacted_json(&secrets)
        .context("redact receipt")?;
    let receipt_path = home.receipt_path(&state.execution_id);
    let mut bytes = serde_json::to_vec_pretty(&redacted).context("serialize receipt")?;
    bytes.push(b'\n');
    atomic_write(&receipt_path, &bytes).context("write receipt")?;

    // Return the receipt exactly as persisted.
    let receipt: Receipt = serde_json::from_value(redacted).context("reload redacted receipt")?;
    match &failure {
        Some(f) => warn!(execution_id = %receipt.execution_id, error = %f.message, "cast failed"),
        None => info!(execution_id = %receipt.execution_id, "cast succeeded"),
    }
    Ok(CastOutcome {
        receipt,
        receipt_path,
        failure,
    })
}
