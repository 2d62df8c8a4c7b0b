// SPDX-License-Identifier: MIT OR Apache-2.0
//! spell-core
#![deny(unsafe_code)]
//!
//! The stable contract for the spell runtime.
//!
//! Everything that crosses a crate boundary — manifests, receipts, the
//! error taxonomy, dynamic values — lives here. If you only take one
//! dependency, take this one.

/// Stable error codes shared by the CLI and the execution API.
pub mod error;
/// Spell manifest model and YAML loader.
pub mod manifest;
/// Output reference resolution (`step.<name>.stdout` / `step.<name>.json`).
pub mod outputs;
/// Receipt model: step results, rollback summary, signature summary.
pub mod receipt;
/// Sensitive-value redaction for receipts.
pub mod redact;
/// Placeholder templating over dynamic values.
pub mod template;
/// Dot-path access over `serde_json::Value`.
pub mod values;

pub use error::ErrorCode;
pub use manifest::{
    Billing, BillingMode, Check, Effect, ExecutionKind, ManifestError, Permission, Retry,
    RiskLevel, RuntimeSpec, SpellManifest, Step, StepKind, WhenClause, publisher_from_id,
};
pub use outputs::{OutputRefError, resolve_output_reference};
pub use receipt::{
    CheckResult, LicenseSummary, Receipt, ReceiptSummary, RollbackState, RollbackSummary,
    SignatureStatus, SignatureSummary, StepResult, execution_id,
};
pub use template::{TemplateContext, TemplateError, apply_template};

/// Receipt format version embedded in every persisted receipt.
pub const RECEIPT_VERSION: &str = "spell/v1";
