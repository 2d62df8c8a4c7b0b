// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable error codes for the spell runtime.
//!
//! Every user-visible failure carries an [`ErrorCode`]: a machine-readable
//! tag that serialises to `SCREAMING_SNAKE_CASE` and is guaranteed not to
//! change across patch releases. The CLI prints the accompanying message on
//! stderr; the execution API returns the code verbatim in its JSON bodies.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable, stable error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Validation --
    /// Request or argument is structurally invalid.
    BadRequest,
    /// A list/query parameter failed to parse.
    InvalidQuery,
    /// Input rejected by the bundle's JSON schema.
    SchemaValidation,
    /// An output reference path is malformed.
    InvalidOutputPath,

    // -- Gates --
    /// Risk level requires an explicit confirmation.
    RiskConfirmationRequired,
    /// Billing-enabled spell cast without billing consent.
    BillingNotAllowed,
    /// Billing-enabled spell cast without a matching license.
    LicenseRequired,
    /// A declared connector permission has no token in the environment.
    PermissionMissing,
    /// Host platform is not supported by the manifest.
    PlatformMismatch,
    /// The policy document denied the cast.
    PolicyDenied,

    // -- Trust --
    /// Signature verification was demanded but the bundle is not verified.
    SignatureRequired,
    /// The signature file is present but cryptographically invalid.
    SignatureInvalid,
    /// No trusted key is available for the signing publisher.
    SignatureUntrusted,

    // -- Execution --
    /// A step exited non-zero or its executor failed.
    StepFailed,
    /// The step graph contains an unsatisfiable dependency cycle.
    StepDeadlock,
    /// A single step exceeded its timeout.
    StepTimeout,
    /// The whole execution exceeded its deadline.
    ExecutionTimeout,
    /// Rollback did not fully compensate and policy demands it.
    CompensationIncomplete,

    // -- API --
    /// No credentials were presented.
    AuthRequired,
    /// Presented credentials did not match any configured token.
    AuthInvalid,
    /// The caller's role is not allowed for this button.
    RoleNotAllowed,
    /// Cross-tenant read attempted by a non-admin role.
    TenantForbidden,
    /// The button restricts tenants and the caller is not listed.
    TenantNotAllowed,
    /// The endpoint requires an admin role.
    AdminRoleRequired,
    /// Cancel requested on an execution that already terminated.
    AlreadyTerminal,
    /// Retry requested on an execution that is not in a retryable state.
    NotRetryable,
    /// Idempotency key replayed with a different body.
    IdempotencyConflict,
    /// Global in-flight execution cap reached.
    ConcurrencyLimited,
    /// Per-tenant in-flight execution cap reached.
    TenantConcurrencyLimited,
    /// Global request rate exceeded.
    RateLimited,
    /// Per-tenant request rate exceeded.
    TenantRateLimited,

    // -- Lookup / catch-all --
    /// The requested resource does not exist.
    NotFound,
    /// The requested output key does not exist on the receipt.
    OutputNotFound,
    /// Unexpected internal error.
    Internal,
}

impl ErrorCode {
    /// The canonical `SCREAMING_SNAKE_CASE` string for this code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::InvalidQuery => "INVALID_QUERY",
            Self::SchemaValidation => "SCHEMA_VALIDATION",
            Self::InvalidOutputPath => "INVALID_OUTPUT_PATH",
            Self::RiskConfirmationRequired => "RISK_CONFIRMATION_REQUIRED",
            Self::BillingNotAllowed => "BILLING_NOT_ALLOWED",
            Self::LicenseRequired => "LICENSE_REQUIRED",
            Self::PermissionMissing => "PERMISSION_MISSING",
            Self::PlatformMismatch => "PLATFORM_MISMATCH",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::SignatureRequired => "SIGNATURE_REQUIRED",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::SignatureUntrusted => "SIGNATURE_UNTRUSTED",
            Self::StepFailed => "STEP_FAILED",
            Self::StepDeadlock => "STEP_DEADLOCK",
            Self::StepTimeout => "STEP_TIMEOUT",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::CompensationIncomplete => "COMPENSATION_INCOMPLETE",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::AuthInvalid => "AUTH_INVALID",
            Self::RoleNotAllowed => "ROLE_NOT_ALLOWED",
            Self::TenantForbidden => "TENANT_FORBIDDEN",
            Self::TenantNotAllowed => "TENANT_NOT_ALLOWED",
            Self::AdminRoleRequired => "ADMIN_ROLE_REQUIRED",
            Self::AlreadyTerminal => "ALREADY_TERMINAL",
            Self::NotRetryable => "NOT_RETRYABLE",
            Self::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            Self::ConcurrencyLimited => "CONCURRENCY_LIMITED",
            Self::TenantConcurrencyLimited => "TENANT_CONCURRENCY_LIMITED",
            Self::RateLimited => "RATE_LIMITED",
            Self::TenantRateLimited => "TENANT_RATE_LIMITED",
            Self::NotFound => "NOT_FOUND",
            Self::OutputNotFound => "OUTPUT_NOT_FOUND",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
