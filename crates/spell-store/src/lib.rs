// SPDX-License-Identifier: MIT OR Apache-2.0
//! spell-store
#![deny(unsafe_code)]
//!
//! Everything that lives under `~/.spell`: the deterministic directory
//! layout, atomic write-then-rename persistence, the installed-bundle
//! store, the registry configuration, and environment-derived runtime
//! limits.

/// Environment-derived runtime and API limits.
pub mod env;
/// Atomic write-then-rename and JSON file helpers.
pub mod fsutil;
/// Installed-bundle store and install provenance.
pub mod install;
/// The `~/.spell` directory layout.
pub mod paths;
/// Registry configuration store.
pub mod registry;

pub use env::RuntimeLimits;
pub use fsutil::{atomic_write, atomic_write_json, read_json};
pub use install::{InstalledBundle, SourceRecord, SourceType, SpellStore, StoreError};
pub use paths::{SpellHome, id_key};
pub use registry::{RegistryConfig, RequiredPins};
