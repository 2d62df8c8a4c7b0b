// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command implementations for the `spell` binary.
//!
//! Every failure surfaces as a single-line message on stderr and exit
//! code 1; the engine has already written a receipt by the time a cast
//! failure reaches the caller.

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use spell_core::outputs::resolve_output_reference;
use spell_core::receipt::{Receipt, SignatureStatus};
use spell_engine::{CancelToken, CastOptions};
use spell_policy::PolicyDocument;
use spell_store::{RegistryConfig, RuntimeLimits, SpellHome, SpellStore, read_json};
use spell_trust::{LicenseStore, TrustStore, TrustedKey, sign_bundle, verify_bundle};
use std::path::{Path, PathBuf};

fn home() -> Result<SpellHome> {
    SpellHome::discover()
}

// ---------------------------------------------------------------------------
// install / list / inspect
// ---------------------------------------------------------------------------

pub fn install(source: &str) -> Result<()> {
    let home = home()?;
    for prefix in ["git:", "oci:", "registry:"] {
        if source.starts_with(prefix) {
            bail!("unsupported install source: {source}");
        }
    }
    let dir = PathBuf::from(source.strip_prefix("local:").unwrap_or(source));
    if !dir.is_dir() {
        bail!("install source is not a directory: {source}");
    }
    let installed = SpellStore::new(home).install_local(&dir)?;
    println!(
        "installed {}@{}",
        installed.manifest.id, installed.manifest.version
    );
    Ok(())
}

pub fn list() -> Result<()> {
    let store = SpellStore::new(home()?);
    for (id, version) in store.list()? {
        println!("{id}@{version}");
    }
    Ok(())
}

pub fn inspect(id: &str, version: Option<&str>) -> Result<()> {
    let store = SpellStore::new(home()?);
    let bundle = store.resolve(id, version)?;
    println!("{}", serde_json::to_string_pretty(&bundle.manifest)?);
    if let Some(source) = store.source_record(&bundle)? {
        println!("{}", serde_json::to_string_pretty(&source)?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// cast / log / get-output
// ---------------------------------------------------------------------------

/// Arguments for [`cast`].
pub struct CastArgs {
    pub id: String,
    pub version: Option<String>,
    pub params: Vec<String>,
    pub input: Option<PathBuf>,
    pub dry_run: bool,
    pub yes: bool,
    pub allow_billing: bool,
    pub require_signature: bool,
    pub allow_unsigned: bool,
    pub verbose: bool,
}

pub async fn cast(args: CastArgs) -> Result<()> {
    let home = home()?;
    let input_json = match &args.input {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("read input file {}", path.display()))?,
        ),
        None => None,
    };
    let mut params = Vec::with_capacity(args.params.len());
    for raw in &args.params {
        let Some((key, value)) = raw.split_once('=') else {
            bail!("parameter '{raw}' must look like key=value");
        };
        params.push((key.to_string(), value.to_string()));
    }

    let options = CastOptions {
        id: args.id.clone(),
        version: args.version.clone(),
        input_json,
        params,
        dry_run: args.dry_run,
        yes: args.yes,
        allow_billing: args.allow_billing,
        require_signature: args.require_signature,
        allow_unsigned: args.allow_unsigned,
        limits: RuntimeLimits::from_env()?,
        execution_id: None,
    };

    // Ctrl-C cancels cooperatively: the in-flight step is killed and the
    // receipt still gets written.
    let token = CancelToken::new();
    let ctrlc = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrlc.cancel();
        }
    });

    let outcome = spell_engine::cast(&home, &options, &token).await?;
    if args.verbose {
        println!("{}", serde_json::to_string_pretty(&outcome.receipt)?);
    }
    match outcome.failure {
        None => {
            println!("{}", outcome.receipt.execution_id);
            Ok(())
        }
        Some(failure) => bail!("{}", failure.message),
    }
}

fn load_receipt(home: &SpellHome, execution_id: &str) -> Result<Receipt> {
    read_json(&home.receipt_path(execution_id))?
        .with_context(|| format!("no receipt for execution '{execution_id}'"))
}

pub fn log(execution_id: &str) -> Result<()> {
    let receipt = load_receipt(&home()?, execution_id)?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

pub fn get_output(execution_id: &str, path: &str) -> Result<()> {
    let receipt = load_receipt(&home()?, execution_id)?;
    let value = resolve_output_reference(&receipt.outputs, path)?;
    match value.as_str() {
        Some(s) => println!("{s}"),
        None => println!("{}", serde_json::to_string_pretty(&value)?),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// registry
// ---------------------------------------------------------------------------

pub fn registry_set(name: &str) -> Result<()> {
    let home = home()?;
    let mut cfg = RegistryConfig::load(&home)?;
    cfg.set_default(name)?;
    cfg.save(&home)?;
    println!("default registry set to {name}");
    Ok(())
}

pub fn registry_add(name: &str, url: &str) -> Result<()> {
    let home = home()?;
    let mut cfg = RegistryConfig::load(&home)?;
    cfg.add(name, url);
    cfg.validate()?;
    cfg.save(&home)?;
    println!("registry {name} -> {url}");
    Ok(())
}

pub fn registry_remove(name: &str) -> Result<()> {
    let home = home()?;
    let mut cfg = RegistryConfig::load(&home)?;
    if !cfg.remove(name) {
        bail!("unknown registry '{name}'");
    }
    cfg.save(&home)?;
    println!("removed registry {name}");
    Ok(())
}

pub fn registry_show() -> Result<()> {
    let cfg = RegistryConfig::load(&home()?)?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

pub fn registry_validate() -> Result<()> {
    RegistryConfig::load(&home()?)?.validate()?;
    let pins = spell_store::RequiredPins::from_env()?;
    println!("registry configuration is valid (required pins: {})", match pins {
        spell_store::RequiredPins::None => "none",
        spell_store::RequiredPins::Commit => "commit",
        spell_store::RequiredPins::Digest => "digest",
        spell_store::RequiredPins::Both => "both",
    });
    Ok(())
}

pub fn registry_resolve(name: Option<&str>) -> Result<()> {
    let cfg = RegistryConfig::load(&home()?)?;
    println!("{}", cfg.resolve_index(name)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// trust
// ---------------------------------------------------------------------------

pub fn trust_add(publisher: &str, key_id: &str, public_key: &str) -> Result<()> {
    let der = URL_SAFE_NO_PAD
        .decode(public_key)
        .context("public key must be base64url (no padding)")?;
    let raw = spell_trust::spki_to_raw(&der)?;
    let verifying = ed25519_dalek::VerifyingKey::from_bytes(&raw)
        .context("public key is not a valid Ed25519 point")?;
    let trust = TrustStore::new(home()?);
    trust.upsert(publisher, TrustedKey::new(key_id, &verifying))?;
    println!(
        "trusted {publisher}/{key_id} ({})",
        spell_trust::fingerprint(&der)
    );
    Ok(())
}

pub fn trust_list() -> Result<()> {
    let trust = TrustStore::new(home()?);
    for publisher in trust.publishers()? {
        if let Some(record) = trust.load(&publisher)? {
            for key in &record.keys {
                let state = if key.revoked { "revoked" } else { "active" };
                println!(
                    "{publisher}/{} {} {state}",
                    key.key_id,
                    key.fingerprint().unwrap_or_else(|_| "????????".into())
                );
            }
        }
    }
    Ok(())
}

pub fn trust_inspect(publisher: &str) -> Result<()> {
    let trust = TrustStore::new(home()?);
    let record = trust
        .load(publisher)?
        .with_context(|| format!("unknown publisher '{publisher}'"))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub fn trust_remove_key(publisher: &str, key_id: &str) -> Result<()> {
    TrustStore::new(home()?).remove(publisher, key_id)?;
    println!("removed {publisher}/{key_id}");
    Ok(())
}

pub fn trust_revoke_key(publisher: &str, key_id: &str, reason: &str) -> Result<()> {
    TrustStore::new(home()?).revoke(publisher, key_id, reason)?;
    println!("revoked {publisher}/{key_id}");
    Ok(())
}

pub fn trust_restore_key(publisher: &str, key_id: &str) -> Result<()> {
    TrustStore::new(home()?).restore(publisher, key_id)?;
    println!("restored {publisher}/{key_id}");
    Ok(())
}

// ---------------------------------------------------------------------------
// sign / verify
// ---------------------------------------------------------------------------

pub fn sign_keygen(publisher: &str, key_id: &str) -> Result<()> {
    let home = home()?;
    let key_path = home.key_path(publisher, key_id);
    if key_path.exists() {
        bail!("key already exists: {}", key_path.display());
    }

    let signing = SigningKey::generate(&mut OsRng);
    if let Some(parent) = key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&key_path, URL_SAFE_NO_PAD.encode(signing.to_bytes()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    let entry = TrustedKey::new(key_id, &signing.verifying_key());
    let fingerprint = entry.fingerprint()?;
    TrustStore::new(home).upsert(publisher, entry)?;
    println!("generated {publisher}/{key_id} ({fingerprint})");
    println!("private key: {}", key_path.display());
    Ok(())
}

fn load_signing_key(home: &SpellHome, publisher: &str, key_id: &str) -> Result<SigningKey> {
    let key_path = home.key_path(publisher, key_id);
    let encoded = std::fs::read_to_string(&key_path)
        .with_context(|| format!("no signing key at {}", key_path.display()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .context("signing key file is not base64url")?;
    let seed: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("signing key file must hold 32 key bytes"))?;
    Ok(SigningKey::from_bytes(&seed))
}

pub fn sign_bundle_cmd(id: &str, version: Option<&str>, key_id: &str) -> Result<()> {
    let home = home()?;
    let bundle = SpellStore::new(home.clone()).resolve(id, version)?;
    let publisher = bundle.manifest.publisher().to_string();
    let signing = load_signing_key(&home, &publisher, key_id)?;
    let file = sign_bundle(&bundle.path, &publisher, key_id, &signing)?;
    println!(
        "signed {}@{} ({}:{})",
        bundle.manifest.id, bundle.manifest.version, file.digest.algorithm, file.digest.value
    );
    Ok(())
}

pub fn verify(id: &str, version: Option<&str>) -> Result<()> {
    let home = home()?;
    let bundle = SpellStore::new(home.clone()).resolve(id, version)?;
    let report = verify_bundle(&bundle.manifest, &bundle.path, &TrustStore::new(home));
    let status = serde_json::to_value(report.status)?
        .as_str()
        .unwrap_or("unknown")
        .to_string();
    if report.status == SignatureStatus::Verified {
        println!(
            "verified (publisher={}, key_id={})",
            report.publisher.unwrap_or_default(),
            report.key_id.unwrap_or_default()
        );
        Ok(())
    } else {
        let detail = report.message.unwrap_or_else(|| "no detail".to_string());
        bail!("signature not verified ({status}): {detail}");
    }
}

// ---------------------------------------------------------------------------
// license
// ---------------------------------------------------------------------------

pub fn license_add(name: &str, token: &str) -> Result<()> {
    let home = home()?;
    let record = LicenseStore::new(home.clone()).add(name, token, &TrustStore::new(home))?;
    println!(
        "added license {name} (issuer={}, mode={})",
        record.claims.issuer,
        serde_json::to_value(record.claims.mode)?
            .as_str()
            .unwrap_or("?")
    );
    Ok(())
}

pub fn license_list() -> Result<()> {
    for record in LicenseStore::new(home()?).list()? {
        let state = if record.revoked { "revoked" } else { "active" };
        println!(
            "{} {} {} {state}",
            record.name, record.claims.issuer, record.claims.currency
        );
    }
    Ok(())
}

pub fn license_inspect(name: &str) -> Result<()> {
    let record = LicenseStore::new(home()?)
        .load(name)?
        .with_context(|| format!("unknown license '{name}'"))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub fn license_remove(name: &str) -> Result<()> {
    LicenseStore::new(home()?).remove(name)?;
    println!("removed license {name}");
    Ok(())
}

pub fn license_revoke(name: &str, reason: &str) -> Result<()> {
    LicenseStore::new(home()?).revoke(name, reason)?;
    println!("revoked license {name}");
    Ok(())
}

pub fn license_restore(name: &str) -> Result<()> {
    LicenseStore::new(home()?).restore(name)?;
    println!("restored license {name}");
    Ok(())
}

// ---------------------------------------------------------------------------
// policy
// ---------------------------------------------------------------------------

pub fn policy_show() -> Result<()> {
    let policy = PolicyDocument::load(&home()?)?;
    println!("{}", serde_json::to_string_pretty(&policy)?);
    Ok(())
}

pub fn policy_validate(file: Option<&Path>) -> Result<()> {
    match file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            PolicyDocument::from_json(&text)?;
        }
        None => {
            PolicyDocument::load(&home()?)?;
        }
    }
    println!("policy is valid");
    Ok(())
}

pub fn policy_set(file: &Path) -> Result<()> {
    let text =
        std::fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let policy = PolicyDocument::from_json(&text)?;
    policy.save(&home()?)?;
    println!("policy updated");
    Ok(())
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

pub async fn serve() -> Result<()> {
    let home = home()?;
    let config = spell_api::ApiConfig::from_env()?;
    spell_api::serve(home, config).await
}
