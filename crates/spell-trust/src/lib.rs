// SPDX-License-Identifier: MIT OR Apache-2.0
//! spell-trust
#![deny(unsafe_code)]
//!
//! The bundle integrity and trust layer: deterministic content digests,
//! the publisher trust store, Ed25519 bundle signatures, and entitlement
//! tokens with their local license store.

/// Canonical bundle content digest.
pub mod digest;
/// Entitlement token encoding, parsing, and verification.
pub mod entitlement;
/// Local license store over entitlement tokens.
pub mod license;
/// Bundle signing and signature verification.
pub mod signature;
/// Publisher trust store.
pub mod store;

pub use digest::{BundleDigest, DigestError, compute_bundle_digest};
pub use entitlement::{EntitlementClaims, TokenError, encode_token, parse_token, verify_token};
pub use license::{LicenseRecord, LicenseStore, license_matches_billing};
pub use signature::{SignatureFile, SignatureReport, sign_bundle, verify_bundle};
pub use store::{PublisherTrust, TrustStore, TrustedKey, fingerprint, spki_from_raw, spki_to_raw};
