// SPDX-License-Identifier: MIT OR Apache-2.0
//! Registry configuration store.
//!
//! `registry.json` names the index endpoints that the (external) registry
//! resolver may consult, plus which provenance pins an install must carry.
//! Network resolution itself is an external collaborator; this store only
//! manages the configuration.

use crate::fsutil::{atomic_write_json, read_json};
use crate::paths::SpellHome;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which provenance pins a registry install must record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequiredPins {
    /// No pinning required.
    None,
    /// A git commit must be recorded.
    Commit,
    /// An image digest must be recorded.
    Digest,
    /// Both commit and digest must be recorded.
    #[default]
    Both,
}

impl RequiredPins {
    /// Parse `SPELL_REGISTRY_REQUIRED_PINS`; unset defaults to `both`.
    pub fn from_env() -> Result<Self> {
        match std::env::var("SPELL_REGISTRY_REQUIRED_PINS") {
            Ok(raw) => match raw.as_str() {
                "none" => Ok(Self::None),
                "commit" => Ok(Self::Commit),
                "digest" => Ok(Self::Digest),
                "both" => Ok(Self::Both),
                other => bail!(
                    "SPELL_REGISTRY_REQUIRED_PINS must be one of none|commit|digest|both, got '{other}'"
                ),
            },
            Err(_) => Ok(Self::default()),
        }
    }

    /// Whether a source record satisfies this pin requirement.
    #[must_use]
    pub fn satisfied_by(&self, commit: Option<&str>, digest: Option<&str>) -> bool {
        match self {
            Self::None => true,
            Self::Commit => commit.is_some(),
            Self::Digest => digest.is_some(),
            Self::Both => commit.is_some() && digest.is_some(),
        }
    }
}

/// The persisted registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    /// Name of the registry used when none is specified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Named registry index URLs.
    #[serde(default)]
    pub registries: BTreeMap<String, String>,
}

impl RegistryConfig {
    /// Load `registry.json`, defaulting to an empty configuration.
    pub fn load(home: &SpellHome) -> Result<Self> {
        Ok(read_json(&home.registry_path())?.unwrap_or_default())
    }

    /// Persist the configuration atomically.
    pub fn save(&self, home: &SpellHome) -> Result<()> {
        atomic_write_json(&home.registry_path(), self)
    }

    /// Add or replace a named registry.
    pub fn add(&mut self, name: impl Into<String>, url: impl Into<String>) {
        let name = name.into();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.registries.insert(name, url.into());
    }

    /// Remove a named registry. Clears `default` when it pointed there.
    pub fn remove(&mut self, name: &str) -> bool {
        let removed = self.registries.remove(name).is_some();
        if removed && self.default.as_deref() == Some(name) {
            self.default = self.registries.keys().next().cloned();
        }
        removed
    }

    /// Set the default registry, which must exist.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.registries.contains_key(name) {
            bail!("unknown registry '{name}'");
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    /// Validate internal consistency and URL shape.
    pub fn validate(&self) -> Result<()> {
        if let Some(default) = &self.default {
            if !self.registries.contains_key(default) {
                bail!("default registry '{default}' is not configured");
            }
        }
        for (name, url) in &self.registries {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                bail!("registry '{name}' has a non-http(s) url: {url}");
            }
        }
        Ok(())
    }

    /// The index URL for `name`, or the default registry when `None`.
    pub fn resolve_index(&self, name: Option<&str>) -> Result<&str> {
        let name = match name {
            Some(n) => n,
            None => self
                .default
                .as_deref()
                .context("no default registry configured")?,
        };
        self.registries
            .get(name)
            .map(String::as_str)
            .with_context(|| format!("unknown registry '{name}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sets_first_default() {
        let mut cfg = RegistryConfig::default();
        cfg.add("main", "https://idx.example.com");
        cfg.add("alt", "https://alt.example.com");
        assert_eq!(cfg.default.as_deref(), Some("main"));
        assert_eq!(
            cfg.resolve_index(None).unwrap(),
            "https://idx.example.com"
        );
        assert_eq!(
            cfg.resolve_index(Some("alt")).unwrap(),
            "https://alt.example.com"
        );
    }

    #[test]
    fn remove_clears_dangling_default() {
        let mut cfg = RegistryConfig::default();
        cfg.add("main", "https://idx.example.com");
        assert!(cfg.remove("main"));
        assert!(cfg.default.is_none());
        assert!(cfg.resolve_index(None).is_err());
    }

    #[test]
    fn validate_rejects_bad_urls() {
        let mut cfg = RegistryConfig::default();
        cfg.add("main", "ftp://idx.example.com");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pins_matrix() {
        assert!(RequiredPins::None.satisfied_by(None, None));
        assert!(RequiredPins::Commit.satisfied_by(Some("abc"), None));
        assert!(!RequiredPins::Commit.satisfied_by(None, Some("sha256:x")));
        assert!(RequiredPins::Both.satisfied_by(Some("abc"), Some("sha256:x")));
        assert!(!RequiredPins::Both.satisfied_by(Some("abc"), None));
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let home = SpellHome::new(tmp.path().join(".spell"));
        let mut cfg = RegistryConfig::default();
        cfg.add("main", "https://idx.example.com");
        cfg.save(&home).unwrap();
        let back = RegistryConfig::load(&home).unwrap();
        assert_eq!(back.default.as_deref(), Some("main"));
    }
}
