// SPDX-License-Identifier: MIT OR Apache-2.0
//! spell-policy
#![deny(unsafe_code)]
//!
//! Operator policy for casts. A single `policy.json` document gates every
//! execution: a default stance, an effects rule, a signature rule, and a
//! rollback rule the orchestrator consults after compensation.

use anyhow::{Context, Result, bail};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use spell_core::manifest::{Effect, ExecutionKind, RiskLevel};
use spell_core::receipt::SignatureStatus;
use spell_store::{SpellHome, atomic_write_json, read_json};

/// Default stance when no rule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDefault {
    /// Casts run unless a rule denies them.
    #[default]
    Allow,
    /// Nothing runs.
    Deny,
}

/// Effect-based rules.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct EffectRules {
    /// Deny any spell declaring a mutating effect.
    #[serde(default)]
    pub deny_mutations: bool,
}

/// Signature-based rules.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct SignatureRules {
    /// Require `verified` signature status for every cast.
    #[serde(default)]
    pub require_verified: bool,
}

/// Rollback-outcome rules, consumed post-execution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct RollbackRules {
    /// Escalate any failure that is not fully compensated.
    #[serde(default)]
    pub require_full_compensation: bool,
}

/// The persisted policy document.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PolicyDocument {
    /// Always `v1`.
    pub version: String,
    /// Default stance.
    #[serde(default)]
    pub default: PolicyDefault,
    /// Effect rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effects: Option<EffectRules>,
    /// Signature rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureRules>,
    /// Rollback rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackRules>,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            default: PolicyDefault::Allow,
            effects: None,
            signature: None,
            rollback: None,
        }
    }
}

impl PolicyDocument {
    /// Load `policy.json`, defaulting to allow-everything when absent.
    pub fn load(home: &SpellHome) -> Result<Self> {
        let doc: Self = read_json(&home.policy_path())?.unwrap_or_default();
        doc.validate()?;
        Ok(doc)
    }

    /// Persist the document atomically.
    pub fn save(&self, home: &SpellHome) -> Result<()> {
        self.validate()?;
        atomic_write_json(&home.policy_path(), self)
    }

    /// Parse and validate a policy from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        let doc: Self = serde_json::from_str(text).context("parse policy document")?;
        doc.validate()?;
        Ok(doc)
    }

    /// Check the version tag.
    pub fn validate(&self) -> Result<()> {
        if self.version != "v1" {
            bail!("unsupported policy version '{}'", self.version);
        }
        Ok(())
    }

    /// Whether failed casts must be fully compensated.
    #[must_use]
    pub fn requires_full_compensation(&self) -> bool {
        self.rollback
            .as_ref()
            .is_some_and(|r| r.require_full_compensation)
    }
}

/// Facts about the cast the evaluator needs.
#[derive(Debug, Clone)]
pub struct PolicyContext<'a> {
    /// Slashed spell id.
    pub spell_id: &'a str,
    /// Publisher segment of the id.
    pub publisher: &'a str,
    /// Declared risk.
    pub risk: RiskLevel,
    /// Host or docker execution.
    pub execution: ExecutionKind,
    /// Declared effects.
    pub effects: &'a [Effect],
    /// Signature verification outcome.
    pub signature_status: SignatureStatus,
}

/// The evaluator's verdict.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Decision {
    /// Whether the cast may proceed.
    pub allow: bool,
    /// Why, when denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Decision {
    /// An allowing decision.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
        }
    }

    /// A denying decision with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
        }
    }
}

/// Evaluate the policy against a cast context.
///
/// Rule order: default stance, then effect rules, then the signature
/// requirement. The rollback rule is not consulted here; the orchestrator
/// applies it after compensation has run.
#[must_use]
pub fn evaluate(policy: &PolicyDocument, ctx: &PolicyContext<'_>) -> Decision {
    if policy.default == PolicyDefault::Deny {
        return Decision::deny(format!(
            "default policy denies cast of {}",
            ctx.spell_id
        ));
    }

    if let Some(effects) = &policy.effects {
        if effects.deny_mutations {
            if let Some(effect) = ctx.effects.iter().find(|e| e.mutates) {
                return Decision::deny(format!(
                    "policy denies mutating effects ({} on {})",
                    effect.kind, effect.target
                ));
            }
        }
    }

    if let Some(signature) = &policy.signature {
        if signature.require_verified && ctx.signature_status != SignatureStatus::Verified {
            return Decision::deny(format!(
                "policy requires a verified signature (status: {})",
                serde_json::to_value(ctx.signature_status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string())
            ));
        }
    }

    Decision::allow()
}
