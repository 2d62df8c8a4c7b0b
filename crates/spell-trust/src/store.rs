// SPDX-License-Identifier: MIT OR Apache-2.0
//! Publisher trust store.
//!
//! One JSON file per publisher under `trust/`. Revoked keys are retained
//! for audit and fail verification; removing the last key deletes the
//! publisher file. Legacy records that predate the revocation fields load
//! as active keys.

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use spell_store::{SpellHome, atomic_write_json, read_json};

/// SPKI DER prefix for an Ed25519 public key (RFC 8410).
const SPKI_ED25519_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// One trusted public key for a publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedKey {
    /// Caller-chosen key identifier, unique per publisher.
    pub key_id: String,
    /// Always `ed25519`.
    pub algorithm: String,
    /// SPKI DER bytes, base64url (no padding).
    pub public_key: String,
    /// Whether this key has been revoked. Revoked keys stay on disk.
    #[serde(default)]
    pub revoked: bool,
    /// When the key was revoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Why the key was revoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_reason: Option<String>,
}

impl TrustedKey {
    /// Build an active key entry from a verifying key.
    #[must_use]
    pub fn new(key_id: impl Into<String>, key: &VerifyingKey) -> Self {
        Self {
            key_id: key_id.into(),
            algorithm: "ed25519".to_string(),
            public_key: URL_SAFE_NO_PAD.encode(spki_from_raw(key)),
            revoked: false,
            revoked_at: None,
            revoke_reason: None,
        }
    }

    /// Decode the stored SPKI DER back into a verifying key.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        let der = URL_SAFE_NO_PAD
            .decode(&self.public_key)
            .context("public_key is not base64url")?;
        let raw = spki_to_raw(&der).context("public_key is not Ed25519 SPKI DER")?;
        VerifyingKey::from_bytes(&raw).context("public_key bytes are not a valid Ed25519 point")
    }

    /// Short fingerprint of the SPKI DER bytes for listings.
    pub fn fingerprint(&self) -> Result<String> {
        let der = URL_SAFE_NO_PAD
            .decode(&self.public_key)
            .context("public_key is not base64url")?;
        Ok(fingerprint(&der))
    }
}

/// Encode a verifying key as SPKI DER.
#[must_use]
pub fn spki_from_raw(key: &VerifyingKey) -> Vec<u8> {
    let mut der = Vec::with_capacity(44);
    der.extend_from_slice(&SPKI_ED25519_PREFIX);
    der.extend_from_slice(key.as_bytes());
    der
}

/// Extract the raw 32 key bytes from SPKI DER.
pub fn spki_to_raw(der: &[u8]) -> Result<[u8; 32]> {
    if der.len() != 44 || der[..12] != SPKI_ED25519_PREFIX {
        bail!("not an Ed25519 SubjectPublicKeyInfo");
    }
    let mut raw = [0u8; 32];
    raw.copy_from_slice(&der[12..]);
    Ok(raw)
}

/// Short fingerprint: first 16 hex chars of SHA-256 over the DER bytes.
#[must_use]
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    hex::encode(digest)[..16].to_string()
}

/// The keys trusted for one publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherTrust {
    /// Publisher name (the id prefix).
    pub publisher: String,
    /// Key entries, active and revoked.
    pub keys: Vec<TrustedKey>,
}

impl PublisherTrust {
    /// Find a key by id.
    #[must_use]
    pub fn key(&self, key_id: &str) -> Option<&TrustedKey> {
        self.keys.iter().find(|k| k.key_id == key_id)
    }
}

/// Trust store rooted at a [`SpellHome`].
#[derive(Debug, Clone)]
pub struct TrustStore {
    home: SpellHome,
}

impl TrustStore {
    /// Open the trust store over `home`.
    #[must_use]
    pub fn new(home: SpellHome) -> Self {
        Self { home }
    }

    /// Load the trust record for a publisher, `None` when unknown.
    pub fn load(&self, publisher: &str) -> Result<Option<PublisherTrust>> {
        read_json(&self.home.trust_path(publisher))
    }

    /// List every publisher with a trust file, sorted.
    pub fn publishers(&self) -> Result<Vec<String>> {
        let dir = self.home.trust_dir();
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(out);
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(publisher) = name.strip_suffix(".json") {
                out.push(publisher.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    /// Add or replace a key for a publisher.
    pub fn upsert(&self, publisher: &str, key: TrustedKey) -> Result<()> {
        let mut trust = self.load(publisher)?.unwrap_or(PublisherTrust {
            publisher: publisher.to_string(),
            keys: Vec::new(),
        });
        trust.keys.retain(|k| k.key_id != key.key_id);
        trust.keys.push(key);
        self.save(&trust)
    }

    /// Mark a key revoked, keeping it on disk for audit.
    pub fn revoke(&self, publisher: &str, key_id: &str, reason: &str) -> Result<()> {
        self.update_key(publisher, key_id, |key| {
            key.revoked = true;
            key.revoked_at = Some(Utc::now());
            key.revoke_reason = Some(reason.to_string());
        })
    }

    /// Clear a key's revocation.
    pub fn restore(&self, publisher: &str, key_id: &str) -> Result<()> {
        self.update_key(publisher, key_id, |key| {
            key.revoked = false;
            key.revoked_at = None;
            key.revoke_reason = None;
        })
    }

    /// Remove a key entirely. Deletes the publisher file when the key list
    /// becomes empty.
    pub fn remove(&self, publisher: &str, key_id: &str) -> Result<()> {
        let mut trust = self
            .load(publisher)?
            .with_context(|| format!("unknown publisher '{publisher}'"))?;
        let before = trust.keys.len();
        trust.keys.retain(|k| k.key_id != key_id);
        if trust.keys.len() == before {
            bail!("unknown key '{key_id}' for publisher '{publisher}'");
        }
        if trust.keys.is_empty() {
            std::fs::remove_file(self.home.trust_path(publisher))
                .with_context(|| format!("delete trust file for '{publisher}'"))?;
            return Ok(());
        }
        self.save(&trust)
    }

    fn update_key(
        &self,
        publisher: &str,
        key_id: &str,
        apply: impl FnOnce(&mut TrustedKey),
    ) -> Result<()> {
        let mut trust = self
            .load(publisher)?
            .with_context(|| format!("unknown publisher '{publisher}'"))?;
        let key = trust
            .keys
            .iter_mut()
            .find(|k| k.key_id == key_id)
            .with_context(|| format!("unknown key '{key_id}' for publisher '{publisher}'"))?;
        apply(key);
        self.save(&trust)
    }

    fn save(&self, trust: &PublisherTrust) -> Result<()> {
        atomic_write_json(&self.home.trust_path(&trust.publisher), trust)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn store() -> (tempfile::TempDir, TrustStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = TrustStore::new(SpellHome::new(tmp.path().join(".spell")));
        (tmp, store)
    }

    fn key_entry(key_id: &str) -> TrustedKey {
        let sk = SigningKey::generate(&mut OsRng);
        TrustedKey::new(key_id, &sk.verifying_key())
    }

    #[test]
    fn upsert_then_load() {
        let (_tmp, store) = store();
        store.upsert("acme", key_entry("k1")).unwrap();
        let trust = store.load("acme").unwrap().unwrap();
        assert_eq!(trust.publisher, "acme");
        assert_eq!(trust.keys.len(), 1);
        assert!(!trust.keys[0].revoked);
        trust.keys[0].verifying_key().unwrap();
    }

    #[test]
    fn unknown_publisher_loads_none() {
        let (_tmp, store) = store();
        assert!(store.load("nobody").unwrap().is_none());
    }

    #[test]
    fn revoke_and_restore_toggle_flag() {
        let (_tmp, store) = store();
        store.upsert("acme", key_entry("k1")).unwrap();

        store.revoke("acme", "k1", "compromised").unwrap();
        let trust = store.load("acme").unwrap().unwrap();
        assert!(trust.keys[0].revoked);
        assert_eq!(trust.keys[0].revoke_reason.as_deref(), Some("compromised"));
        assert!(trust.keys[0].revoked_at.is_some());

        store.restore("acme", "k1").unwrap();
        let trust = store.load("acme").unwrap().unwrap();
        assert!(!trust.keys[0].revoked);
        assert!(trust.keys[0].revoked_at.is_none());
    }

    #[test]
    fn removing_last_key_deletes_publisher_file() {
        let (_tmp, store) = store();
        store.upsert("acme", key_entry("k1")).unwrap();
        store.upsert("acme", key_entry("k2")).unwrap();

        store.remove("acme", "k1").unwrap();
        assert_eq!(store.load("acme").unwrap().unwrap().keys.len(), 1);

        store.remove("acme", "k2").unwrap();
        assert!(store.load("acme").unwrap().is_none());
        assert!(store.publishers().unwrap().is_empty());
    }

    #[test]
    fn legacy_record_without_revocation_fields_is_active() {
        let (_tmp, store) = store();
        let sk = SigningKey::generate(&mut OsRng);
        let legacy = serde_json::json!({
            "publisher": "acme",
            "keys": [{
                "key_id": "old",
                "algorithm": "ed25519",
                "public_key": URL_SAFE_NO_PAD.encode(spki_from_raw(&sk.verifying_key())),
            }]
        });
        let path = store.home.trust_path("acme");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, serde_json::to_vec(&legacy).unwrap()).unwrap();

        let trust = store.load("acme").unwrap().unwrap();
        assert!(!trust.keys[0].revoked);
        assert!(trust.keys[0].revoked_at.is_none());
    }

    #[test]
    fn spki_round_trip_and_fingerprint() {
        let sk = SigningKey::generate(&mut OsRng);
        let vk = sk.verifying_key();
        let der = spki_from_raw(&vk);
        assert_eq!(der.len(), 44);
        let raw = spki_to_raw(&der).unwrap();
        assert_eq!(&raw, vk.as_bytes());

        let fp = fingerprint(&der);
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn spki_rejects_foreign_der() {
        assert!(spki_to_raw(&[0u8; 44]).is_err());
        assert!(spki_to_raw(&[0u8; 10]).is_err());
    }
}
