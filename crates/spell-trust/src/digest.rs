// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical bundle content digest.
//!
//! The digest covers `spell.yaml`, `schema.json`, and every regular file
//! under `steps/`, in POSIX-path sort order, with a domain separator so
//! bundle digests can never collide with other sha256 uses. Two identical
//! trees produce identical digests on any platform; `spell.sig.json` is
//! excluded so the signature can cover the digest.

use sha2::{Digest, Sha256};
use spell_core::manifest::{MANIFEST_FILE, SCHEMA_FILE};
use std::path::Path;
use thiserror::Error;
use walkdir::WalkDir;

/// Domain separator absorbed before any file content.
const DOMAIN: &[u8] = b"spell-bundle-v1\0";

/// Errors while digesting a bundle tree.
#[derive(Debug, Error)]
pub enum DigestError {
    /// A required file is missing or unreadable.
    #[error("failed to read {path}")]
    Read {
        /// Path relative to the bundle root.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The tree contains a symlink, which the digest refuses to follow.
    #[error("bundle contains symlink: {path}")]
    Symlink {
        /// Path relative to the bundle root.
        path: String,
    },

    /// Directory traversal failed.
    #[error("failed to walk bundle tree")]
    Walk(#[from] walkdir::Error),
}

/// The computed content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleDigest {
    /// Always `sha256`.
    pub algorithm: &'static str,
    /// Lowercase hex encoding of the digest.
    pub hex: String,
    /// The raw 32 digest bytes; this is what gets signed.
    pub bytes: [u8; 32],
}

/// Compute the canonical digest of a bundle directory.
pub fn compute_bundle_digest(bundle_dir: &Path) -> Result<BundleDigest, DigestError> {
    // Collect (posix relpath, absolute path) entries, then sort; traversal
    // order must not influence the digest.
    let mut entries: Vec<(String, std::path::PathBuf)> = Vec::new();

    for name in [MANIFEST_FILE, SCHEMA_FILE] {
        let path = bundle_dir.join(name);
        reject_symlink(&path, name)?;
        entries.push((name.to_string(), path));
    }

    let steps_root = bundle_dir.join("steps");
    if steps_root.exists() {
        for entry in WalkDir::new(&steps_root).follow_links(false) {
            let entry = entry?;
            let rel = posix_rel(bundle_dir, entry.path());
            if entry.path_is_symlink() {
                return Err(DigestError::Symlink { path: rel });
            }
            if entry.file_type().is_file() {
                entries.push((rel, entry.path().to_path_buf()));
            }
        }
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN);
    for (rel, path) in &entries {
        let contents = std::fs::read(path).map_err(|source| DigestError::Read {
            path: rel.clone(),
            source,
        })?;
        hasher.update(b"file\0");
        hasher.update(rel.as_bytes());
        hasher.update(b"\0");
        hasher.update(&contents);
        hasher.update(b"\0");
    }

    let bytes: [u8; 32] = hasher.finalize().into();
    Ok(BundleDigest {
        algorithm: "sha256",
        hex: hex::encode(bytes),
        bytes,
    })
}

fn posix_rel(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn reject_symlink(path: &Path, rel: &str) -> Result<(), DigestError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(DigestError::Symlink {
            path: rel.to_string(),
        }),
        _ => Ok(()),
    }
}
