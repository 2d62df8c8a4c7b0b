// SPDX-License-Identifier: MIT OR Apache-2.0
//! Atomic file persistence.
//!
//! All mutable stores (trust, licenses, policy, registry, execution index,
//! idempotency map) persist through the same pattern: write a sibling temp
//! file, fsync it, rename over the target, fsync the directory. Readers
//! always see a consistent snapshot.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Write `bytes` to `path` atomically.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("store");
    let tmp = dir.join(format!(".{file_name}.tmp"));

    {
        let mut f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("write {}", tmp.display()))?;
        f.sync_all()
            .with_context(|| format!("fsync {}", tmp.display()))?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} over {}", tmp.display(), path.display()))?;

    // Persist the rename itself. Directory fsync is unsupported on some
    // platforms; failure here does not lose the write.
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value).context("serialize JSON")?;
    bytes.push(b'\n');
    atomic_write(path, &bytes)
}

/// Read and deserialize a JSON file, returning `None` when absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        n: u32,
        tag: String,
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let doc = Doc {
            n: 7,
            tag: "x".into(),
        };
        atomic_write_json(&path, &doc).unwrap();
        let back: Option<Doc> = read_json(&path).unwrap();
        assert_eq!(back, Some(doc));
    }

    #[test]
    fn missing_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let back: Option<Doc> = read_json(&dir.path().join("missing.json")).unwrap();
        assert!(back.is_none());
    }

    #[test]
    fn overwrite_replaces_whole_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        atomic_write_json(&path, &Doc { n: 1, tag: "a".into() }).unwrap();
        atomic_write_json(&path, &Doc { n: 2, tag: "b".into() }).unwrap();
        let back: Option<Doc> = read_json(&path).unwrap();
        assert_eq!(back.unwrap().n, 2);
    }

    #[test]
    fn creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep/nested/doc.json");
        atomic_write_json(&path, &Doc { n: 3, tag: "c".into() }).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        atomic_write_json(&path, &Doc { n: 1, tag: "a".into() }).unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["doc.json".to_string()]);
    }

    #[test]
    fn corrupt_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        fs::write(&path, b"{nope").unwrap();
        let res: Result<Option<Doc>> = read_json(&path);
        assert!(res.is_err());
    }
}
