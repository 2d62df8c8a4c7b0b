// SPDX-License-Identifier: MIT OR Apache-2.0
//! Entitlement tokens: `ent1.<payload>.<sig>`.
//!
//! The payload is base64url (no padding) JSON; the Ed25519 signature is
//! computed over the UTF-8 bytes of the payload *segment* (the base64url
//! text, not the decoded JSON), so the token can be verified without
//! re-canonicalizing the claims.

use crate::store::TrustStore;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde::{Deserialize, Serialize};
use spell_core::BillingMode;
use thiserror::Error;

/// Token prefix / format version.
const PREFIX: &str = "ent1";

/// Claims carried by an entitlement token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitlementClaims {
    /// Always `v1`.
    pub version: String,
    /// Publisher that issued the token; must be trusted for verification.
    pub issuer: String,
    /// Issuer key that signed the token.
    pub key_id: String,
    /// Billing mode this token entitles.
    pub mode: BillingMode,
    /// Currency the entitlement is denominated in.
    pub currency: String,
    /// Maximum amount the entitlement covers.
    pub max_amount: f64,
    /// Validity window start (unix seconds).
    pub not_before: i64,
    /// Validity window end (unix seconds).
    pub expires_at: i64,
}

impl EntitlementClaims {
    /// Whether `now` falls inside the validity window.
    #[must_use]
    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        let t = now.timestamp();
        self.not_before <= t && t <= self.expires_at
    }
}

/// Failures while parsing or verifying a token.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Not three `.`-separated segments with the `ent1` prefix.
    #[error("malformed entitlement token: {reason}")]
    Malformed {
        /// What was wrong.
        reason: String,
    },

    /// Claims are present but inconsistent.
    #[error("invalid entitlement claims: {reason}")]
    InvalidClaims {
        /// Which claim constraint failed.
        reason: String,
    },

    /// The issuer is not in the trust store or the key is unusable.
    #[error("untrusted entitlement issuer: {reason}")]
    Untrusted {
        /// Why trust failed.
        reason: String,
    },

    /// The signature does not verify.
    #[error("entitlement signature does not verify")]
    BadSignature,

    /// The token is outside its validity window.
    #[error("entitlement token is outside its validity window")]
    Expired,

    /// Trust store I/O failed.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Encode claims into a signed `ent1.…` token.
pub fn encode_token(claims: &EntitlementClaims, key: &SigningKey) -> Result<String, TokenError> {
    if claims.not_before > claims.expires_at {
        return Err(TokenError::InvalidClaims {
            reason: "not_before is after expires_at".to_string(),
        });
    }
    let payload_json = serde_json::to_vec(claims).map_err(|e| TokenError::Malformed {
        reason: format!("claims serialization: {e}"),
    })?;
    let payload = URL_SAFE_NO_PAD.encode(payload_json);
    let signature = key.sign(payload.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(signature.to_bytes());
    Ok(format!("{PREFIX}.{payload}.{sig}"))
}

/// Parse a token without verifying the signature.
///
/// Returns the claims plus the payload segment and decoded signature, so
/// verification can run over the exact signed bytes.
pub fn parse_token(raw: &str) -> Result<(EntitlementClaims, String, Vec<u8>), TokenError> {
    let mut parts = raw.split('.');
    let (prefix, payload, sig) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(p), Some(payload), Some(sig), None) => (p, payload, sig),
        _ => {
            return Err(TokenError::Malformed {
                reason: "expected three dot-separated segments".to_string(),
            });
        }
    };
    if prefix != PREFIX {
        return Err(TokenError::Malformed {
            reason: format!("unknown prefix '{prefix}'"),
        });
    }

    let payload_json = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| TokenError::Malformed {
            reason: format!("payload is not base64url: {e}"),
        })?;
    let claims: EntitlementClaims =
        serde_json::from_slice(&payload_json).map_err(|e| TokenError::Malformed {
            reason: format!("payload is not a claim set: {e}"),
        })?;

    if claims.version != "v1" {
        return Err(TokenError::InvalidClaims {
            reason: format!("unsupported claims version '{}'", claims.version),
        });
    }
    if claims.not_before > claims.expires_at {
        return Err(TokenError::InvalidClaims {
            reason: "not_before is after expires_at".to_string(),
        });
    }

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig)
        .map_err(|e| TokenError::Malformed {
            reason: format!("signature is not base64url: {e}"),
        })?;

    Ok((claims, payload.to_string(), sig_bytes))
}

/// Fully verify a token: parse, check issuer trust, verify the signature
/// over the payload segment, and require `now` inside the window.
pub fn verify_token(
    raw: &str,
    trust: &TrustStore,
    now: DateTime<Utc>,
) -> Result<EntitlementClaims, TokenError> {
    let (claims, payload, sig_bytes) = parse_token(raw)?;

    let publisher_trust =
        trust
            .load(&claims.issuer)?
            .ok_or_else(|| TokenError::Untrusted {
                reason: format!("no trust record for issuer '{}'", claims.issuer),
            })?;
    let key = publisher_trust
        .key(&claims.key_id)
        .ok_or_else(|| TokenError::Untrusted {
            reason: format!("issuer '{}' has no key '{}'", claims.issuer, claims.key_id),
        })?;
    if key.revoked {
        return Err(TokenError::Untrusted {
            reason: format!("issuer key '{}' is revoked", claims.key_id),
        });
    }

    let verifying_key = key.verifying_key().map_err(|e| TokenError::Untrusted {
        reason: format!("issuer key '{}' is unusable: {e}", claims.key_id),
    })?;
    let signature = Signature::from_slice(&sig_bytes).map_err(|_| TokenError::BadSignature)?;
    verifying_key
        .verify(payload.as_bytes(), &signature)
        .map_err(|_| TokenError::BadSignature)?;

    if !claims.in_window(now) {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TrustedKey;
    use rand_core::OsRng;
    use spell_store::SpellHome;

    fn claims() -> EntitlementClaims {
        EntitlementClaims {
            version: "v1".to_string(),
            issuer: "acme".to_string(),
            key_id: "lic".to_string(),
            mode: BillingMode::OnSuccess,
            currency: "USD".to_string(),
            max_amount: 100.0,
            not_before: 1_700_000_000,
            expires_at: 4_102_444_800,
        }
    }

    fn trusted() -> (tempfile::TempDir, TrustStore, SigningKey) {
        let tmp = tempfile::tempdir().unwrap();
        let trust = TrustStore::new(SpellHome::new(tmp.path().join(".spell")));
        let key = SigningKey::generate(&mut OsRng);
        trust
            .upsert("acme", TrustedKey::new("lic", &key.verifying_key()))
            .unwrap();
        (tmp, trust, key)
    }

    #[test]
    fn encode_parse_round_trip() {
        let key = SigningKey::generate(&mut OsRng);
        let token = encode_token(&claims(), &key).unwrap();
        assert!(token.starts_with("ent1."));
        let (parsed, _, _) = parse_token(&token).unwrap();
        assert_eq!(parsed, claims());
    }

    #[test]
    fn verify_accepts_trusted_token() {
        let (_tmp, trust, key) = trusted();
        let token = encode_token(&claims(), &key).unwrap();
        let now = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        let verified = verify_token(&token, &trust, now).unwrap();
        assert_eq!(verified.currency, "USD");
    }

    #[test]
    fn wrong_prefix_is_malformed() {
        let err = parse_token("ent2.abc.def").unwrap_err();
        assert!(matches!(err, TokenError::Malformed { .. }));
    }

    #[test]
    fn two_segments_is_malformed() {
        let err = parse_token("ent1.abconly").unwrap_err();
        assert!(matches!(err, TokenError::Malformed { .. }));
    }

    #[test]
    fn inverted_window_is_invalid() {
        let mut c = claims();
        c.not_before = c.expires_at + 1;
        let key = SigningKey::generate(&mut OsRng);
        assert!(matches!(
            encode_token(&c, &key).unwrap_err(),
            TokenError::InvalidClaims { .. }
        ));
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let (_tmp, trust, key) = trusted();
        let token = encode_token(&claims(), &key).unwrap();

        // Re-encode a modified payload while keeping the original signature.
        let parts: Vec<&str> = token.split('.').collect();
        let mut c = claims();
        c.max_amount = 100_000.0;
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&c).unwrap());
        let forged = format!("ent1.{forged_payload}.{}", parts[2]);

        let now = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        assert!(matches!(
            verify_token(&forged, &trust, now).unwrap_err(),
            TokenError::BadSignature
        ));
    }

    #[test]
    fn untrusted_issuer_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let trust = TrustStore::new(SpellHome::new(tmp.path().join(".spell")));
        let key = SigningKey::generate(&mut OsRng);
        let token = encode_token(&claims(), &key).unwrap();
        let now = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        assert!(matches!(
            verify_token(&token, &trust, now).unwrap_err(),
            TokenError::Untrusted { .. }
        ));
    }

    #[test]
    fn revoked_issuer_key_is_rejected() {
        let (_tmp, trust, key) = trusted();
        let token = encode_token(&claims(), &key).unwrap();
        trust.revoke("acme", "lic", "rotated").unwrap();
        let now = DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        assert!(matches!(
            verify_token(&token, &trust, now).unwrap_err(),
            TokenError::Untrusted { .. }
        ));
    }

    #[test]
    fn out_of_window_is_expired() {
        let (_tmp, trust, key) = trusted();
        let token = encode_token(&claims(), &key).unwrap();
        let before = DateTime::from_timestamp(1_000_000_000, 0).unwrap();
        assert!(matches!(
            verify_token(&token, &trust, before).unwrap_err(),
            TokenError::Expired
        ));
        let after = DateTime::from_timestamp(4_102_444_801, 0).unwrap();
        assert!(matches!(
            verify_token(&token, &trust, after).unwrap_err(),
            TokenError::Expired
        ));
    }
}
