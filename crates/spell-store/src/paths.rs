// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `~/.spell` directory layout.
//!
//! Every persistent artifact has a deterministic path derived from this
//! root:
//!
//! ```text
//! ~/.spell/
//!   spells/<idKey>/<version>/{spell.yaml, schema.json, steps/**, source.json}
//!   trust/<publisher>.json
//!   licenses/<base64url(name)>.json
//!   policy.json
//!   registry.json
//!   buttons.json
//!   logs/<execution_id>.json
//!   logs/index.json
//!   logs/tenant-audit.jsonl
//! ```

use std::path::{Path, PathBuf};

/// Root of the spell runtime's persistent state.
#[derive(Debug, Clone)]
pub struct SpellHome {
    root: PathBuf,
}

/// Filesystem-safe key for a slashed spell id (`acme/hello` → `acme__hello`).
#[must_use]
pub fn id_key(id: &str) -> String {
    id.replace('/', "__")
}

impl SpellHome {
    /// Use an explicit root. Tests point this at a temp directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `$HOME/.spell`, preferring the `HOME` env var so test
    /// harnesses can relocate the whole tree.
    pub fn discover() -> anyhow::Result<Self> {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        Ok(Self::new(home.join(".spell")))
    }

    /// The root directory itself.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding installed bundles.
    #[must_use]
    pub fn spells_dir(&self) -> PathBuf {
        self.root.join("spells")
    }

    /// Install location for one `id@version`.
    #[must_use]
    pub fn bundle_dir(&self, id: &str, version: &str) -> PathBuf {
        self.spells_dir().join(id_key(id)).join(version)
    }

    /// Directory of per-publisher trust files.
    #[must_use]
    pub fn trust_dir(&self) -> PathBuf {
        self.root.join("trust")
    }

    /// Trust file for one publisher.
    #[must_use]
    pub fn trust_path(&self, publisher: &str) -> PathBuf {
        self.trust_dir().join(format!("{publisher}.json"))
    }

    /// Directory of license records.
    #[must_use]
    pub fn licenses_dir(&self) -> PathBuf {
        self.root.join("licenses")
    }

    /// The policy document.
    #[must_use]
    pub fn policy_path(&self) -> PathBuf {
        self.root.join("policy.json")
    }

    /// The registry configuration.
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    /// The button registry consumed by the API server.
    #[must_use]
    pub fn buttons_path(&self) -> PathBuf {
        self.root.join("buttons.json")
    }

    /// Directory of receipts and the API index.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Receipt file for one execution.
    #[must_use]
    pub fn receipt_path(&self, execution_id: &str) -> PathBuf {
        self.logs_dir().join(format!("{execution_id}.json"))
    }

    /// The persisted execution index.
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.logs_dir().join("index.json")
    }

    /// The tenant audit log.
    #[must_use]
    pub fn audit_path(&self) -> PathBuf {
        self.logs_dir().join("tenant-audit.jsonl")
    }

    /// Directory of locally-held signing keys.
    #[must_use]
    pub fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    /// Signing-key file for one publisher key.
    #[must_use]
    pub fn key_path(&self, publisher: &str, key_id: &str) -> PathBuf {
        self.keys_dir().join(format!("{publisher}.{key_id}.key"))
    }
}
