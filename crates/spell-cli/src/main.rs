// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The `spell` command-line interface.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors (usage errors exit 2 via clap).
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "spell", version, about = "Signed workflow bundle runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install a bundle from a source (local directory; git/oci/registry
    /// sources are resolved by external handlers).
    Install {
        /// Source: a local directory path, or `git:…`, `oci:…`, `registry:…`.
        source: String,
    },

    /// List installed spells.
    List,

    /// Show an installed spell's manifest and provenance.
    Inspect {
        /// Spell id (`publisher/name`).
        id: String,
        /// Pinned version; highest installed when omitted.
        #[arg(long)]
        version: Option<String>,
    },

    /// Cast a spell.
    Cast {
        /// Spell id (`publisher/name`).
        id: String,
        /// Pinned version; highest installed when omitted.
        #[arg(long)]
        version: Option<String>,
        /// Input overrides as dot-path key=value pairs.
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
        /// JSON file with the base input object.
        #[arg(long)]
        input: Option<PathBuf>,
        /// Validate and gate without running steps.
        #[arg(long)]
        dry_run: bool,
        /// Confirm high/critical risk.
        #[arg(long)]
        yes: bool,
        /// Consent to billing-enabled spells.
        #[arg(long)]
        allow_billing: bool,
        /// Demand a verified bundle signature.
        #[arg(long, conflicts_with = "allow_unsigned")]
        require_signature: bool,
        /// Skip signature verification.
        #[arg(long)]
        allow_unsigned: bool,
        /// Print the full receipt on completion.
        #[arg(long)]
        verbose: bool,
    },

    /// Print a receipt by execution id.
    Log {
        /// Execution id (receipt file stem under `logs/`).
        execution_id: String,
    },

    /// Print one output value from a receipt.
    GetOutput {
        /// Execution id.
        execution_id: String,
        /// Output reference (`step.<name>.stdout`, `step.<name>.json…`).
        path: String,
    },

    /// Manage registry configuration.
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },

    /// Manage the publisher trust store.
    Trust {
        #[command(subcommand)]
        command: TrustCommands,
    },

    /// Generate signing keys and sign bundles.
    Sign {
        #[command(subcommand)]
        command: SignCommands,
    },

    /// Verify an installed bundle's signature.
    Verify {
        /// Spell id.
        id: String,
        /// Pinned version; highest installed when omitted.
        #[arg(long)]
        version: Option<String>,
    },

    /// Manage entitlement licenses.
    License {
        #[command(subcommand)]
        command: LicenseCommands,
    },

    /// Manage the cast policy.
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Run the execution API server.
    Serve,

    /// In-container scheduler entry point for docker execution.
    #[command(hide = true)]
    StepRunner,
}

#[derive(Subcommand, Debug)]
enum RegistryCommands {
    /// Set the default registry.
    Set {
        /// Registry name.
        name: String,
    },
    /// Add a named registry index.
    Add {
        /// Registry name.
        name: String,
        /// Index URL.
        url: String,
    },
    /// Remove a named registry.
    Remove {
        /// Registry name.
        name: String,
    },
    /// Show the registry configuration.
    Show,
    /// Validate the registry configuration.
    Validate,
    /// Print the index URL a name resolves to.
    Resolve {
        /// Registry name; the default registry when omitted.
        name: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum TrustCommands {
    /// Trust a publisher key.
    Add {
        /// Publisher name.
        publisher: String,
        /// Key id.
        key_id: String,
        /// Public key: SPKI DER, base64url (no padding).
        public_key: String,
    },
    /// List trusted publishers and key fingerprints.
    List,
    /// Show one publisher's keys.
    Inspect {
        /// Publisher name.
        publisher: String,
    },
    /// Remove a key (deletes the publisher file when it was the last one).
    RemoveKey {
        /// Publisher name.
        publisher: String,
        /// Key id.
        key_id: String,
    },
    /// Revoke a key, keeping it on disk for audit.
    RevokeKey {
        /// Publisher name.
        publisher: String,
        /// Key id.
        key_id: String,
        /// Revocation reason.
        #[arg(long, default_value = "revoked by operator")]
        reason: String,
    },
    /// Clear a key's revocation.
    RestoreKey {
        /// Publisher name.
        publisher: String,
        /// Key id.
        key_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum SignCommands {
    /// Generate a keypair, store the private key, trust the public key.
    Keygen {
        /// Publisher name.
        publisher: String,
        /// Key id.
        key_id: String,
    },
    /// Sign an installed bundle, writing `spell.sig.json`.
    Bundle {
        /// Spell id.
        id: String,
        /// Pinned version; highest installed when omitted.
        #[arg(long)]
        version: Option<String>,
        /// Key id to sign with.
        #[arg(long)]
        key_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum LicenseCommands {
    /// Add a named entitlement token (verified against the trust store).
    Add {
        /// License name.
        name: String,
        /// The raw `ent1.…` token.
        token: String,
    },
    /// List licenses.
    List,
    /// Show one license.
    Inspect {
        /// License name.
        name: String,
    },
    /// Remove a license.
    Remove {
        /// License name.
        name: String,
    },
    /// Revoke a license.
    Revoke {
        /// License name.
        name: String,
        /// Revocation reason.
        #[arg(long, default_value = "revoked by operator")]
        reason: String,
    },
    /// Clear a license's revocation.
    Restore {
        /// License name.
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum PolicyCommands {
    /// Print the active policy.
    Show,
    /// Validate a policy file (or the active policy).
    Validate {
        /// Policy JSON file; the active policy when omitted.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Replace the active policy.
    Set {
        /// Policy JSON file.
        #[arg(long)]
        file: PathBuf,
    },
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    if let Err(err) = run(cli).await {
        eprintln!("{err:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Install { source } => commands::install(&source),
        Commands::List => commands::list(),
        Commands::Inspect { id, version } => commands::inspect(&id, version.as_deref()),
        Commands::Cast {
            id,
            version,
            params,
            input,
            dry_run,
            yes,
            allow_billing,
            require_signature,
            allow_unsigned,
            verbose,
        } => {
            commands::cast(commands::CastArgs {
                id,
                version,
                params,
                input,
                dry_run,
                yes,
                allow_billing,
                require_signature,
                allow_unsigned,
                verbose,
            })
            .await
        }
        Commands::Log { execution_id } => commands::log(&execution_id),
        Commands::GetOutput { execution_id, path } => commands::get_output(&execution_id, &path),
        Commands::Registry { command } => match command {
            RegistryCommands::Set { name } => commands::registry_set(&name),
            RegistryCommands::Add { name, url } => commands::registry_add(&name, &url),
            RegistryCommands::Remove { name } => commands::registry_remove(&name),
            RegistryCommands::Show => commands::registry_show(),
            RegistryCommands::Validate => commands::registry_validate(),
            RegistryCommands::Resolve { name } => commands::registry_resolve(name.as_deref()),
        },
        Commands::Trust { command } => match command {
            TrustCommands::Add {
                publisher,
                key_id,
                public_key,
            } => commands::trust_add(&publisher, &key_id, &public_key),
            TrustCommands::List => commands::trust_list(),
            TrustCommands::Inspect { publisher } => commands::trust_inspect(&publisher),
            TrustCommands::RemoveKey { publisher, key_id } => {
                commands::trust_remove_key(&publisher, &key_id)
            }
            TrustCommands::RevokeKey {
                publisher,
                key_id,
                reason,
            } => commands::trust_revoke_key(&publisher, &key_id, &reason),
            TrustCommands::RestoreKey { publisher, key_id } => {
                commands::trust_restore_key(&publisher, &key_id)
            }
        },
        Commands::Sign { command } => match command {
            SignCommands::Keygen { publisher, key_id } => {
                commands::sign_keygen(&publisher, &key_id)
            }
            SignCommands::Bundle {
                id,
                version,
                key_id,
            } => commands::sign_bundle_cmd(&id, version.as_deref(), &key_id),
        },
        Commands::Verify { id, version } => commands::verify(&id, version.as_deref()),
        Commands::License { command } => match command {
            LicenseCommands::Add { name, token } => commands::license_add(&name, &token),
            LicenseCommands::List => commands::license_list(),
            LicenseCommands::Inspect { name } => commands::license_inspect(&name),
            LicenseCommands::Remove { name } => commands::license_remove(&name),
            LicenseCommands::Revoke { name, reason } => commands::license_revoke(&name, &reason),
            LicenseCommands::Restore { name } => commands::license_restore(&name),
        },
        Commands::Policy { command } => match command {
            PolicyCommands::Show => commands::policy_show(),
            PolicyCommands::Validate { file } => commands::policy_validate(file.as_deref()),
            PolicyCommands::Set { file } => commands::policy_set(&file),
        },
        Commands::Serve => commands::serve().await,
        Commands::StepRunner => spell_engine::docker::serve_runner().await,
    }
}
