// SPDX-License-Identifier: MIT OR Apache-2.0
//! spell-api
#![deny(unsafe_code)]
//!
//! The multi-tenant execution API: button-gated submissions, per-tenant
//! access control, rate and concurrency limits, idempotent POSTs,
//! cancel/retry, SSE event streams, and a persisted execution index that
//! survives restarts.

/// Tenant audit log (`logs/tenant-audit.jsonl`).
pub mod audit;
/// Bearer-token and role-keyed authentication.
pub mod auth;
/// Button registry.
pub mod buttons;
/// Environment-derived server configuration.
pub mod config;
/// API error type with stable error codes.
pub mod error;
/// Broadcast event bus feeding the SSE streams.
pub mod events;
/// Persisted execution index and idempotency map.
pub mod index;
/// Sliding-window rate limiting.
pub mod limits;
/// Router, handlers, and the execution driver.
pub mod server;

pub use auth::AuthPrincipal;
pub use buttons::{Button, ButtonRegistry};
pub use config::ApiConfig;
pub use error::ApiError;
pub use index::{ExecutionIndex, ExecutionRecord, ExecutionStatus};
pub use server::{ApiState, build_app, serve};
