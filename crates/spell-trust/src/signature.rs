// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bundle signing and verification.
//!
//! `spell.sig.json` carries an Ed25519 signature over the raw bundle
//! digest bytes. Verification is fail-closed: any unexpected condition
//! degrades to a non-`verified` status with a diagnostic, and callers that
//! demand verification reject anything but [`SignatureStatus::Verified`].

use crate::digest::compute_bundle_digest;
use crate::store::TrustStore;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde::{Deserialize, Serialize};
use spell_core::manifest::SIGNATURE_FILE;
use spell_core::receipt::{SignatureStatus, SignatureSummary};
use spell_core::{SpellManifest, publisher_from_id};
use std::path::Path;
use tracing::debug;

/// The digest block inside [`SignatureFile`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureDigest {
    /// Always `sha256`.
    pub algorithm: String,
    /// Lowercase hex digest value.
    pub value: String,
}

/// On-disk shape of `spell.sig.json`. A bit-exact compatibility surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureFile {
    /// Always `v1`.
    pub version: String,
    /// Publisher the signature claims to speak for.
    pub publisher: String,
    /// Key id within the publisher's trust record.
    pub key_id: String,
    /// Always `ed25519`.
    pub algorithm: String,
    /// Digest the signature covers.
    pub digest: SignatureDigest,
    /// Base64url (no padding) Ed25519 signature over the raw digest bytes.
    pub signature: String,
}

/// Outcome of a verification pass, convertible into the receipt summary.
#[derive(Debug, Clone)]
pub struct SignatureReport {
    /// Verification status.
    pub status: SignatureStatus,
    /// Publisher named by the signature file, when one was read.
    pub publisher: Option<String>,
    /// Key id named by the signature file, when one was read.
    pub key_id: Option<String>,
    /// Digest hex from the signature file, when one was read.
    pub digest: Option<String>,
    /// Diagnostic for non-verified outcomes.
    pub message: Option<String>,
}

impl SignatureReport {
    fn status_only(status: SignatureStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            publisher: None,
            key_id: None,
            digest: None,
            message: Some(message.into()),
        }
    }

    /// Fold into the receipt's signature summary.
    #[must_use]
    pub fn into_summary(self, required: bool) -> SignatureSummary {
        SignatureSummary {
            required,
            status: self.status,
            publisher: self.publisher,
            key_id: self.key_id,
            digest: self.digest,
            message: self.message,
        }
    }
}

/// Sign an installed bundle, writing `spell.sig.json` next to the manifest.
pub fn sign_bundle(
    bundle_dir: &Path,
    publisher: &str,
    key_id: &str,
    signing_key: &SigningKey,
) -> anyhow::Result<SignatureFile> {
    let digest = compute_bundle_digest(bundle_dir)?;
    let signature = signing_key.sign(&digest.bytes);
    let file = SignatureFile {
        version: "v1".to_string(),
        publisher: publisher.to_string(),
        key_id: key_id.to_string(),
        algorithm: "ed25519".to_string(),
        digest: SignatureDigest {
            algorithm: "sha256".to_string(),
            value: digest.hex,
        },
        signature: URL_SAFE_NO_PAD.encode(signature.to_bytes()),
    };
    let bytes = serde_json::to_vec_pretty(&file)?;
    std::fs::write(bundle_dir.join(SIGNATURE_FILE), bytes)?;
    Ok(file)
}

/// Verify a bundle signature against the trust store.
///
/// Never returns an error: every failure mode maps onto a non-`verified`
/// status so the caller can apply its own policy.
pub fn verify_bundle(
    manifest: &SpellManifest,
    bundle_dir: &Path,
    trust: &TrustStore,
) -> SignatureReport {
    match verify_inner(manifest, bundle_dir, trust) {
        Ok(report) => report,
        // Fail closed: unexpected errors are never `verified`.
        Err(e) => SignatureReport::status_only(
            SignatureStatus::Invalid,
            format!("signature verification error: {e:#}"),
        ),
    }
}

fn verify_inner(
    manifest: &SpellManifest,
    bundle_dir: &Path,
    trust: &TrustStore,
) -> anyhow::Result<SignatureReport> {
    let sig_path = bundle_dir.join(SIGNATURE_FILE);
    let raw = match std::fs::read(&sig_path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SignatureReport::status_only(
                SignatureStatus::Unsigned,
                "bundle has no spell.sig.json",
            ));
        }
        Err(e) => return Err(e.into()),
    };
    let sig: SignatureFile = serde_json::from_slice(&raw)?;

    let mut report = SignatureReport {
        status: SignatureStatus::Invalid,
        publisher: Some(sig.publisher.clone()),
        key_id: Some(sig.key_id.clone()),
        digest: Some(sig.digest.value.clone()),
        message: None,
    };

    let expected_publisher = publisher_from_id(&manifest.id);
    if sig.publisher != expected_publisher {
        report.message = Some(format!(
            "signature publisher '{}' does not match manifest publisher '{expected_publisher}'",
            sig.publisher
        ));
        return Ok(report);
    }

    let Some(publisher_trust) = trust.load(&sig.publisher)? else {
        report.status = SignatureStatus::Untrusted;
        report.message = Some(format!("no trust record for publisher '{}'", sig.publisher));
        return Ok(report);
    };

    let Some(key) = publisher_trust.key(&sig.key_id) else {
        report.status = SignatureStatus::Untrusted;
        report.message = Some(format!(
            "publisher '{}' has no key '{}'",
            sig.publisher, sig.key_id
        ));
        return Ok(report);
    };
    if key.revoked {
        report.message = Some(format!("key '{}' is revoked", sig.key_id));
        return Ok(report);
    }

    let digest = compute_bundle_digest(bundle_dir)?;
    if digest.hex != sig.digest.value {
        report.message = Some(format!(
            "bundle digest {} does not match signed digest {}",
            digest.hex, sig.digest.value
        ));
        return Ok(report);
    }

    let verifying_key = key.verifying_key()?;
    let sig_bytes = URL_SAFE_NO_PAD.decode(&sig.signature)?;
    let signature = Signature::from_slice(&sig_bytes)?;
    match verifying_key.verify(&digest.bytes, &signature) {
        Ok(()) => {
            debug!(publisher = %sig.publisher, key_id = %sig.key_id, "signature verified");
            report.status = SignatureStatus::Verified;
            Ok(report)
        }
        Err(_) => {
            report.message = Some("ed25519 signature does not verify".to_string());
            Ok(report)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TrustedKey;
    use rand_core::OsRng;
    use spell_store::SpellHome;
    use std::fs;

    fn bundle(dir: &Path) -> SpellManifest {
        fs::create_dir_all(dir.join("steps")).unwrap();
        let yaml = r#"
id: acme/hello
version: 1.0.0
name: Hello
risk: low
steps:
  - uses: shell
    name: hello
    run: steps/hello.sh
"#;
        fs::write(dir.join("spell.yaml"), yaml).unwrap();
        fs::write(dir.join("schema.json"), "{}\n").unwrap();
        fs::write(dir.join("steps/hello.sh"), "echo hello\n").unwrap();
        SpellManifest::from_yaml(yaml).unwrap()
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        bundle_dir: std::path::PathBuf,
        manifest: SpellManifest,
        trust: TrustStore,
        signing_key: SigningKey,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let bundle_dir = tmp.path().join("bundle");
        fs::create_dir_all(&bundle_dir).unwrap();
        let manifest = bundle(&bundle_dir);
        let trust = TrustStore::new(SpellHome::new(tmp.path().join(".spell")));
        let signing_key = SigningKey::generate(&mut OsRng);
        Fixture {
            _tmp: tmp,
            bundle_dir,
            manifest,
            trust,
            signing_key,
        }
    }

    #[test]
    fn signed_and_trusted_verifies() {
        let fx = fixture();
        fx.trust
            .upsert("acme", TrustedKey::new("k1", &fx.signing_key.verifying_key()))
            .unwrap();
        sign_bundle(&fx.bundle_dir, "acme", "k1", &fx.signing_key).unwrap();

        let report = verify_bundle(&fx.manifest, &fx.bundle_dir, &fx.trust);
        assert_eq!(report.status, SignatureStatus::Verified);
        assert_eq!(report.publisher.as_deref(), Some("acme"));
    }

    #[test]
    fn missing_signature_is_unsigned() {
        let fx = fixture();
        let report = verify_bundle(&fx.manifest, &fx.bundle_dir, &fx.trust);
        assert_eq!(report.status, SignatureStatus::Unsigned);
    }

    #[test]
    fn unknown_publisher_is_untrusted() {
        let fx = fixture();
        sign_bundle(&fx.bundle_dir, "acme", "k1", &fx.signing_key).unwrap();
        let report = verify_bundle(&fx.manifest, &fx.bundle_dir, &fx.trust);
        assert_eq!(report.status, SignatureStatus::Untrusted);
    }

    #[test]
    fn publisher_mismatch_is_invalid() {
        let fx = fixture();
        fx.trust
            .upsert("evil", TrustedKey::new("k1", &fx.signing_key.verifying_key()))
            .unwrap();
        sign_bundle(&fx.bundle_dir, "evil", "k1", &fx.signing_key).unwrap();
        let report = verify_bundle(&fx.manifest, &fx.bundle_dir, &fx.trust);
        assert_eq!(report.status, SignatureStatus::Invalid);
        assert!(report.message.unwrap().contains("does not match manifest publisher"));
    }

    #[test]
    fn revoked_key_is_invalid() {
        let fx = fixture();
        fx.trust
            .upsert("acme", TrustedKey::new("k1", &fx.signing_key.verifying_key()))
            .unwrap();
        sign_bundle(&fx.bundle_dir, "acme", "k1", &fx.signing_key).unwrap();
        fx.trust.revoke("acme", "k1", "rotated").unwrap();

        let report = verify_bundle(&fx.manifest, &fx.bundle_dir, &fx.trust);
        assert_eq!(report.status, SignatureStatus::Invalid);
        assert!(report.message.unwrap().contains("revoked"));
    }

    #[test]
    fn tampered_step_file_is_invalid() {
        let fx = fixture();
        fx.trust
            .upsert("acme", TrustedKey::new("k1", &fx.signing_key.verifying_key()))
            .unwrap();
        sign_bundle(&fx.bundle_dir, "acme", "k1", &fx.signing_key).unwrap();
        fs::write(fx.bundle_dir.join("steps/hello.sh"), "echo pwned\n").unwrap();

        let report = verify_bundle(&fx.manifest, &fx.bundle_dir, &fx.trust);
        assert_eq!(report.status, SignatureStatus::Invalid);
        assert!(report.message.unwrap().contains("does not match signed digest"));
    }

    #[test]
    fn flipped_signature_bit_is_invalid() {
        let fx = fixture();
        fx.trust
            .upsert("acme", TrustedKey::new("k1", &fx.signing_key.verifying_key()))
            .unwrap();
        let mut file = sign_bundle(&fx.bundle_dir, "acme", "k1", &fx.signing_key).unwrap();

        let mut sig_bytes = URL_SAFE_NO_PAD.decode(&file.signature).unwrap();
        sig_bytes[0] ^= 0x01;
        file.signature = URL_SAFE_NO_PAD.encode(&sig_bytes);
        fs::write(
            fx.bundle_dir.join(SIGNATURE_FILE),
            serde_json::to_vec(&file).unwrap(),
        )
        .unwrap();

        let report = verify_bundle(&fx.manifest, &fx.bundle_dir, &fx.trust);
        assert_eq!(report.status, SignatureStatus::Invalid);
    }

    #[test]
    fn wrong_key_signature_is_invalid() {
        let fx = fixture();
        // Trust a different key under the same id.
        let other = SigningKey::generate(&mut OsRng);
        fx.trust
            .upsert("acme", TrustedKey::new("k1", &other.verifying_key()))
            .unwrap();
        sign_bundle(&fx.bundle_dir, "acme", "k1", &fx.signing_key).unwrap();

        let report = verify_bundle(&fx.manifest, &fx.bundle_dir, &fx.trust);
        assert_eq!(report.status, SignatureStatus::Invalid);
        assert!(report.message.unwrap().contains("does not verify"));
    }

    #[test]
    fn garbage_signature_file_fails_closed() {
        let fx = fixture();
        fs::write(fx.bundle_dir.join(SIGNATURE_FILE), b"not json").unwrap();
        let report = verify_bundle(&fx.manifest, &fx.bundle_dir, &fx.trust);
        assert_eq!(report.status, SignatureStatus::Invalid);
        assert!(report.message.is_some());
    }
}
