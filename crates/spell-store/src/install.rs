// SPDX-License-Identifier: MIT OR Apache-2.0
//! Installed-bundle store.
//!
//! Bundles are installed by copying a validated directory tree into
//! `spells/<idKey>/<version>/` together with a `source.json` provenance
//! record. Installed bundles are never mutated.

use crate::fsutil::{atomic_write_json, read_json};
use crate::paths::SpellHome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spell_core::manifest::{MANIFEST_FILE, ManifestError, SCHEMA_FILE};
use spell_core::{SpellManifest, publisher_from_id};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Errors from the installed-bundle store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The bundle directory is missing a required file.
    #[error("bundle is missing {file}")]
    MissingFile {
        /// Which required file is absent.
        file: String,
    },

    /// The manifest failed to load or validate.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The requested spell (or version) is not installed.
    #[error("spell not installed: {spec}")]
    NotInstalled {
        /// `id` or `id@version` as requested.
        spec: String,
    },

    /// The requested install source is handled by an external collaborator.
    #[error("unsupported install source: {source_kind}")]
    UnsupportedSource {
        /// The source string as given.
        source_kind: String,
    },

    /// Filesystem-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// How a bundle arrived on this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Copied from a local directory.
    Local,
    /// Cloned from git (external handler).
    Git,
    /// Pulled from an OCI image (external handler).
    Oci,
    /// Resolved through a registry index (external handler).
    Registry,
}

/// Install provenance, persisted as `source.json` next to the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Source family.
    pub source_type: SourceType,
    /// Path, URL, or image reference the bundle came from.
    pub reference: String,
    /// Pinned commit for git sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Pinned image digest for OCI sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// When the install happened.
    pub installed_at: DateTime<Utc>,
}

/// An installed bundle resolved from the store.
#[derive(Debug, Clone)]
pub struct InstalledBundle {
    /// The validated manifest.
    pub manifest: SpellManifest,
    /// Root directory of the installed copy.
    pub path: PathBuf,
}

/// The installed-bundle store rooted at a [`SpellHome`].
#[derive(Debug, Clone)]
pub struct SpellStore {
    home: SpellHome,
}

impl SpellStore {
    /// Open the store over `home`.
    #[must_use]
    pub fn new(home: SpellHome) -> Self {
        Self { home }
    }

    /// The home this store is rooted at.
    #[must_use]
    pub fn home(&self) -> &SpellHome {
        &self.home
    }

    /// Install a bundle from a local directory.
    ///
    /// The source tree must contain `spell.yaml`, `schema.json`, and a
    /// `steps/` directory; the manifest is validated before anything is
    /// copied. Installing the same `id@version` again replaces the copy.
    pub fn install_local(&self, source_dir: &Path) -> Result<InstalledBundle, StoreError> {
        for required in [MANIFEST_FILE, SCHEMA_FILE] {
            if !source_dir.join(required).is_file() {
                return Err(StoreError::MissingFile {
                    file: required.to_string(),
                });
            }
        }
        if !source_dir.join("steps").is_dir() {
            return Err(StoreError::MissingFile {
                file: "steps/".to_string(),
            });
        }

        let manifest = SpellManifest::load(source_dir)?;
        let dest = self.home.bundle_dir(&manifest.id, &manifest.version);
        if dest.exists() {
            std::fs::remove_dir_all(&dest)?;
        }
        copy_tree(source_dir, &dest)?;

        let record = SourceRecord {
            source_type: SourceType::Local,
            reference: source_dir.display().to_string(),
            commit: None,
            digest: None,
            installed_at: Utc::now(),
        };
        atomic_write_json(&dest.join("source.json"), &record)?;

        info!(id = %manifest.id, version = %manifest.version, "installed bundle");
        Ok(InstalledBundle {
            manifest,
            path: dest,
        })
    }

    /// List every installed `(id, version)` pair, sorted.
    pub fn list(&self) -> Result<Vec<(String, String)>, StoreError> {
        let spells = self.home.spells_dir();
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&spells) else {
            return Ok(out);
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry
                .file_name()
                .to_string_lossy()
                .replace("__", "/");
            for ver in std::fs::read_dir(entry.path())? {
                let ver = ver?;
                if ver.file_type()?.is_dir() {
                    out.push((id.clone(), ver.file_name().to_string_lossy().into_owned()));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Resolve an installed bundle by id, picking the highest semver when
    /// `version` is not pinned.
    pub fn resolve(
        &self,
        id: &str,
        version: Option<&str>,
    ) -> Result<InstalledBundle, StoreError> {
        let version = match version {
            Some(v) => v.to_string(),
            None => self.latest_version(id)?,
        };
        let dir = self.home.bundle_dir(id, &version);
        if !dir.join(MANIFEST_FILE).is_file() {
            return Err(StoreError::NotInstalled {
                spec: format!("{id}@{version}"),
            });
        }
        let manifest = SpellManifest::load(&dir)?;
        Ok(InstalledBundle {
            manifest,
            path: dir,
        })
    }

    /// Load the provenance record for an installed bundle.
    pub fn source_record(&self, bundle: &InstalledBundle) -> Result<Option<SourceRecord>, StoreError> {
        Ok(read_json(&bundle.path.join("source.json"))?)
    }

    fn latest_version(&self, id: &str) -> Result<String, StoreError> {
        let mut versions: Vec<semver::Version> = self
            .list()?
            .into_iter()
            .filter(|(i, _)| i == id)
            .filter_map(|(_, v)| semver::Version::parse(&v).ok())
            .collect();
        versions.sort();
        versions
            .pop()
            .map(|v| v.to_string())
            .ok_or_else(|| StoreError::NotInstalled {
                spec: id.to_string(),
            })
    }

    /// Publisher derived from an installed id (used by trust lookups).
    #[must_use]
    pub fn publisher_of(id: &str) -> &str {
        publisher_from_id(id)
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| StoreError::Other(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields children of src");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(rel);
        let ty = entry.file_type();
        if ty.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if ty.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
        // Symlinks are skipped here and rejected later by the digest.
    }
    Ok(())
}
