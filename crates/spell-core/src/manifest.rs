// SPDX-License-Identifier: MIT OR Apache-2.0
//! Spell manifest model and loader.
//!
//! A bundle's `spell.yaml` deserializes into [`SpellManifest`]. The loader
//! validates structural invariants (slashed id, semver version, unique step
//! names, resolvable `depends_on`, well-formed `when` clauses) before the
//! manifest is handed to any other subsystem.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

/// Manifest file name inside a bundle.
pub const MANIFEST_FILE: &str = "spell.yaml";
/// Input schema file name inside a bundle.
pub const SCHEMA_FILE: &str = "schema.json";
/// Signature file name inside a bundle. Excluded from the bundle digest.
pub const SIGNATURE_FILE: &str = "spell.sig.json";

/// Errors produced while loading or validating a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("failed to read {path}")]
    Read {
        /// Path that was requested.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid YAML for the expected shape.
    #[error("failed to parse spell.yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A structural invariant does not hold.
    #[error("invalid manifest: {reason}")]
    Invalid {
        /// Which invariant failed.
        reason: String,
    },
}

impl ManifestError {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

/// Declared blast radius of a spell.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Read-only or trivially reversible.
    Low,
    /// Mutating but contained.
    Medium,
    /// Mutating with external visibility.
    High,
    /// Irreversible or production-facing.
    Critical,
}

impl RiskLevel {
    /// High and critical spells require an explicit `--yes` / confirmation.
    #[must_use]
    pub fn needs_confirmation(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

/// A connector permission declared by the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Permission {
    /// Connector name (e.g. `github`). Gated on `CONNECTOR_<NAME>_TOKEN`.
    pub connector: String,
    /// Scopes requested on the connector.
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A declared side effect.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Effect {
    /// Effect type (free-form, e.g. `deployment`).
    #[serde(rename = "type")]
    pub kind: String,
    /// What the effect touches.
    pub target: String,
    /// Whether the effect mutates the target.
    #[serde(default)]
    pub mutates: bool,
}

/// Billing mode for a billed spell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    /// No billing.
    #[default]
    None,
    /// Charge before execution.
    Upfront,
    /// Charge only on success.
    OnSuccess,
    /// Recurring subscription entitlement.
    Subscription,
}

/// Billing declaration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct Billing {
    /// Whether this spell bills at all.
    #[serde(default)]
    pub enabled: bool,
    /// How the spell bills.
    #[serde(default)]
    pub mode: BillingMode,
    /// ISO currency code (matched case-insensitively against licenses).
    #[serde(default)]
    pub currency: String,
    /// Upper bound the caller may be charged.
    #[serde(default)]
    pub max_amount: f64,
}

/// Where the steps run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    /// Directly on the host.
    #[default]
    Host,
    /// Inside a container via the docker runner.
    Docker,
}

/// Runtime requirements and knobs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct RuntimeSpec {
    /// Host or docker execution.
    #[serde(default)]
    pub execution: ExecutionKind,
    /// Supported `os/arch` platforms. Empty means any platform.
    #[serde(default)]
    pub platforms: Vec<String>,
    /// Container image for docker execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Upper bound on concurrently running steps within one batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_steps: Option<usize>,
}

/// Which executor runs a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Spawn `run` as a process.
    Shell,
    /// Interpret `run` as a JSON http request spec.
    Http,
}

impl StepKind {
    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Http => "http",
        }
    }
}

/// Retry configuration for one step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct Retry {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Sleep between attempts.
    #[serde(default)]
    pub backoff_ms: u64,
}

/// Conditional-execution clause. Exactly one of `input_path`/`output_path`
/// and exactly one of `equals`/`not_equals` must be set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct WhenClause {
    /// Dot path into the resolved input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_path: Option<String>,
    /// Output reference (`step.<name>.stdout` / `step.<name>.json...`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    /// Run the step only when the value equals this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
    /// Run the step only when the value differs from this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_equals: Option<Value>,
}

impl WhenClause {
    fn validate(&self, step: &str) -> Result<(), ManifestError> {
        match (&self.input_path, &self.output_path) {
            (Some(_), Some(_)) => Err(ManifestError::invalid(format!(
                "step '{step}': when clause sets both input_path and output_path"
            ))),
            (None, None) => Err(ManifestError::invalid(format!(
                "step '{step}': when clause needs input_path or output_path"
            ))),
            _ => Ok(()),
        }?;
        match (&self.equals, &self.not_equals) {
            (Some(_), Some(_)) => Err(ManifestError::invalid(format!(
                "step '{step}': when clause sets both equals and not_equals"
            ))),
            (None, None) => Err(ManifestError::invalid(format!(
                "step '{step}': when clause needs equals or not_equals"
            ))),
            _ => Ok(()),
        }
    }
}

/// One declared step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    /// Executor for this step.
    pub uses: StepKind,
    /// Step name, unique within the manifest. Node id in the DAG.
    pub name: String,
    /// Path relative to the bundle root: an executable for shell, a JSON
    /// request spec for http.
    pub run: String,
    /// Optional compensation handler, run in reverse order on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<String>,
    /// Optional retry configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<Retry>,
    /// Names of steps that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Optional conditional-execution clause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<WhenClause>,
}

/// A post-execution check against the outputs map.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Check {
    /// Check name, reported in the receipt.
    pub name: String,
    /// Output reference to evaluate.
    pub output: String,
    /// Pass when the output equals this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
    /// Pass when the output differs from this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_equals: Option<Value>,
    /// Pass when the output merely contains this substring (strings only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
}

/// The parsed and validated `spell.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SpellManifest {
    /// Slashed identity: `publisher/name`.
    pub id: String,
    /// Semver version string.
    pub version: String,
    /// Human-readable name.
    pub name: String,
    /// One-line summary.
    #[serde(default)]
    pub summary: String,
    /// Declared blast radius.
    pub risk: RiskLevel,
    /// Connector permissions.
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Declared side effects.
    #[serde(default)]
    pub effects: Vec<Effect>,
    /// Billing declaration.
    #[serde(default)]
    pub billing: Billing,
    /// Runtime requirements.
    #[serde(default)]
    pub runtime: RuntimeSpec,
    /// Ordered steps.
    pub steps: Vec<Step>,
    /// Post-execution checks.
    #[serde(default)]
    pub checks: Vec<Check>,
}

impl SpellManifest {
    /// Parse a manifest from YAML text and validate it.
    pub fn from_yaml(text: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_yaml::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load `spell.yaml` from a bundle directory.
    pub fn load(bundle_dir: &Path) -> Result<Self, ManifestError> {
        let path = bundle_dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Publisher segment of the slashed id.
    #[must_use]
    pub fn publisher(&self) -> &str {
        publisher_from_id(&self.id)
    }

    /// Find a step by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Whether any declared effect mutates its target.
    #[must_use]
    pub fn has_mutating_effect(&self) -> bool {
        self.effects.iter().any(|e| e.mutates)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let Some((publisher, short)) = self.id.split_once('/') else {
            return Err(ManifestError::invalid(format!(
                "id '{}' must be 'publisher/name'",
                self.id
            )));
        };
        if publisher.is_empty() || short.is_empty() || short.contains('/') {
            return Err(ManifestError::invalid(format!(
                "id '{}' must be 'publisher/name'",
                self.id
            )));
        }
        if !is_slug(publisher) || !is_slug(short) {
            return Err(ManifestError::invalid(format!(
                "id '{}' may only contain [a-z0-9_-] segments",
                self.id
            )));
        }

        semver::Version::parse(&self.version).map_err(|e| {
            ManifestError::invalid(format!("version '{}' is not semver: {e}", self.version))
        })?;

        if self.steps.is_empty() {
            return Err(ManifestError::invalid("manifest declares no steps"));
        }

        let mut seen: Vec<&str> = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            if step.name.is_empty() || !is_step_name(&step.name) {
                return Err(ManifestError::invalid(format!(
                    "step name '{}' may only contain [A-Za-z0-9_-]",
                    step.name
                )));
            }
            if seen.contains(&step.name.as_str()) {
                return Err(ManifestError::invalid(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
            for dep in &step.depends_on {
                if !seen.contains(&dep.as_str()) {
                    return Err(ManifestError::invalid(format!(
                        "step '{}' depends on unknown or later step '{dep}'",
                        step.name
                    )));
                }
            }
            if let Some(retry) = &step.retry {
                if retry.max_attempts == 0 {
                    return Err(ManifestError::invalid(format!(
                        "step '{}': retry.max_attempts must be at least 1",
                        step.name
                    )));
                }
            }
            if let Some(when) = &step.when {
                when.validate(&step.name)?;
            }
            seen.push(&step.name);
        }

        for check in &self.checks {
            let set = [
                check.equals.is_some(),
                check.not_equals.is_some(),
                check.contains.is_some(),
            ]
            .iter()
            .filter(|b| **b)
            .count();
            if set != 1 {
                return Err(ManifestError::invalid(format!(
                    "check '{}' must set exactly one of equals/not_equals/contains",
                    check.name
                )));
            }
        }

        if self.runtime.execution == ExecutionKind::Docker && self.runtime.image.is_none() {
            return Err(ManifestError::invalid(
                "docker execution requires runtime.image",
            ));
        }

        Ok(())
    }
}

/// Publisher segment of a slashed spell id (text before the first `/`).
#[must_use]
pub fn publisher_from_id(id: &str) -> &str {
    id.split_once('/').map_or(id, |(publisher, _)| publisher)
}

fn is_slug(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

fn is_step_name(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
