// SPDX-License-Identifier: MIT OR Apache-2.0
//! Local license store.
//!
//! A license is a named, locally-held entitlement token. Revocation here is
//! an operator action independent of token expiry; the billing gate honours
//! both.

use crate::entitlement::{EntitlementClaims, parse_token, verify_token};
use crate::store::TrustStore;
use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spell_core::Billing;
use spell_store::{SpellHome, atomic_write_json, read_json};
use tracing::info;

/// One stored license.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseRecord {
    /// Operator-chosen name.
    pub name: String,
    /// The raw `ent1.…` token.
    pub token: String,
    /// Claims parsed at add time.
    pub claims: EntitlementClaims,
    /// Operator revocation flag.
    #[serde(default)]
    pub revoked: bool,
    /// When the license was revoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    /// Why the license was revoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_reason: Option<String>,
    /// Last time the token verified against the trust store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validated_at: Option<DateTime<Utc>>,
}

/// License store rooted at a [`SpellHome`].
#[derive(Debug, Clone)]
pub struct LicenseStore {
    home: SpellHome,
}

impl LicenseStore {
    /// Open the license store over `home`.
    #[must_use]
    pub fn new(home: SpellHome) -> Self {
        Self { home }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        let key = URL_SAFE_NO_PAD.encode(name.as_bytes());
        self.home.licenses_dir().join(format!("{key}.json"))
    }

    /// Add a named license, verifying the token against the trust store.
    pub fn add(&self, name: &str, raw_token: &str, trust: &TrustStore) -> Result<LicenseRecord> {
        if self.load(name)?.is_some() {
            bail!("license '{name}' already exists");
        }
        let now = Utc::now();
        let claims =
            verify_token(raw_token, trust, now).context("entitlement token did not verify")?;
        let record = LicenseRecord {
            name: name.to_string(),
            token: raw_token.to_string(),
            claims,
            revoked: false,
            revoked_at: None,
            revoke_reason: None,
            last_validated_at: Some(now),
        };
        atomic_write_json(&self.path(name), &record)?;
        info!(license = %name, "added license");
        Ok(record)
    }

    /// Add without trust verification (parse-only). Used when the issuer
    /// key will be trusted later; the billing gate re-checks the window.
    pub fn add_unverified(&self, name: &str, raw_token: &str) -> Result<LicenseRecord> {
        if self.load(name)?.is_some() {
            bail!("license '{name}' already exists");
        }
        let (claims, _, _) = parse_token(raw_token)?;
        let record = LicenseRecord {
            name: name.to_string(),
            token: raw_token.to_string(),
            claims,
            revoked: false,
            revoked_at: None,
            revoke_reason: None,
            last_validated_at: None,
        };
        atomic_write_json(&self.path(name), &record)?;
        Ok(record)
    }

    /// Load one license by name.
    pub fn load(&self, name: &str) -> Result<Option<LicenseRecord>> {
        read_json(&self.path(name))
    }

    /// List all licenses, sorted by name.
    pub fn list(&self) -> Result<Vec<LicenseRecord>> {
        let dir = self.home.licenses_dir();
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(out);
        };
        for entry in entries {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = read_json::<LicenseRecord>(&entry.path())? {
                out.push(record);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Delete a license record.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        if !path.exists() {
            bail!("unknown license '{name}'");
        }
        std::fs::remove_file(&path).with_context(|| format!("delete license '{name}'"))
    }

    /// Mark a license revoked.
    pub fn revoke(&self, name: &str, reason: &str) -> Result<()> {
        self.update(name, |record| {
            record.revoked = true;
            record.revoked_at = Some(Utc::now());
            record.revoke_reason = Some(reason.to_string());
        })
    }

    /// Clear a license's revocation.
    pub fn restore(&self, name: &str) -> Result<()> {
        self.update(name, |record| {
            record.revoked = false;
            record.revoked_at = None;
            record.revoke_reason = None;
        })
    }

    /// Find an active license matching a manifest's billing declaration.
    pub fn find_matching(&self, billing: &Billing, now: DateTime<Utc>) -> Result<Option<LicenseRecord>> {
        for record in self.list()? {
            if license_matches_billing(&record, billing, now) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn update(&self, name: &str, apply: impl FnOnce(&mut LicenseRecord)) -> Result<()> {
        let mut record = self
            .load(name)?
            .with_context(|| format!("unknown license '{name}'"))?;
        apply(&mut record);
        atomic_write_json(&self.path(name), &record)
    }
}

/// Whether a license satisfies a billing declaration right now.
#[must_use]
pub fn license_matches_billing(
    record: &LicenseRecord,
    billing: &Billing,
    now: DateTime<Utc>,
) -> bool {
    billing.enabled
        && !record.revoked
        && record.claims.in_window(now)
        && record.claims.mode == billing.mode
        && record.claims.currency.eq_ignore_ascii_case(&billing.currency)
        && record.claims.max_amount >= billing.max_amount
}
