// SPDX-License-Identifier: MIT OR Apache-2.0
//! Server configuration from `SPELL_API_*` environment variables.

use crate::auth::RoleKey;
use anyhow::Result;
use spell_store::env::parse_var;

/// Resolved API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Listener port; `0` requests an ephemeral port.
    pub port: u16,
    /// Maximum accepted request body size.
    pub body_limit_bytes: usize,
    /// Global sliding-window width.
    pub rate_limit_window_ms: u64,
    /// Global request budget per window.
    pub rate_limit_max_requests: u32,
    /// Per-tenant sliding-window width.
    pub tenant_rate_limit_window_ms: u64,
    /// Per-tenant request budget per window.
    pub tenant_rate_limit_max_requests: u32,
    /// Global in-flight execution cap.
    pub max_concurrent_executions: usize,
    /// Per-tenant in-flight execution cap.
    pub tenant_max_concurrent_executions: usize,
    /// Simple bearer tokens (authenticate only).
    pub auth_tokens: Vec<String>,
    /// Role-keyed tokens (`[tenant:]role=token`).
    pub auth_keys: Vec<RoleKey>,
    /// Drop receipts older than this many days.
    pub log_retention_days: Option<i64>,
    /// Keep at most this many receipts.
    pub log_max_files: Option<usize>,
    /// Force `require_signature` for every button.
    pub force_require_signature: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8780,
            body_limit_bytes: 1024 * 1024,
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: 300,
            tenant_rate_limit_window_ms: 60_000,
            tenant_rate_limit_max_requests: 100,
            max_concurrent_executions: 16,
            tenant_max_concurrent_executions: 4,
            auth_tokens: Vec::new(),
            auth_keys: Vec::new(),
            log_retention_days: None,
            log_max_files: None,
            force_require_signature: false,
        }
    }
}

impl ApiConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = parse_var::<u16>("SPELL_API_PORT")? {
            cfg.port = v;
        }
        if let Some(v) = parse_var::<usize>("SPELL_API_BODY_LIMIT_BYTES")? {
            cfg.body_limit_bytes = v;
        }
        if let Some(v) = parse_var::<u64>("SPELL_API_RATE_LIMIT_WINDOW_MS")? {
            cfg.rate_limit_window_ms = v;
        }
        if let Some(v) = parse_var::<u32>("SPELL_API_RATE_LIMIT_MAX_REQUESTS")? {
            cfg.rate_limit_max_requests = v;
        }
        if let Some(v) = parse_var::<u64>("SPELL_API_TENANT_RATE_LIMIT_WINDOW_MS")? {
            cfg.tenant_rate_limit_window_ms = v;
        }
        if let Some(v) = parse_var::<u32>("SPELL_API_TENANT_RATE_LIMIT_MAX_REQUESTS")? {
            cfg.tenant_rate_limit_max_requests = v;
        }
        if let Some(v) = parse_var::<usize>("SPELL_API_MAX_CONCURRENT_EXECUTIONS")? {
            cfg.max_concurrent_executions = v;
        }
        if let Some(v) = parse_var::<usize>("SPELL_API_TENANT_MAX_CONCURRENT_EXECUTIONS")? {
            cfg.tenant_max_concurrent_executions = v;
        }
        if let Ok(raw) = std::env::var("SPELL_API_AUTH_TOKENS") {
            cfg.auth_tokens = split_csv(&raw);
        }
        if let Ok(raw) = std::env::var("SPELL_API_AUTH_KEYS") {
            cfg.auth_keys = split_csv(&raw)
                .iter()
                .map(|entry| RoleKey::parse(entry))
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(v) = parse_var::<i64>("SPELL_API_LOG_RETENTION_DAYS")? {
            cfg.log_retention_days = (v > 0).then_some(v);
        }
        if let Some(v) = parse_var::<usize>("SPELL_API_LOG_MAX_FILES")? {
            cfg.log_max_files = (v > 0).then_some(v);
        }
        if let Ok(raw) = std::env::var("SPELL_API_FORCE_REQUIRE_SIGNATURE") {
            cfg.force_require_signature = matches!(raw.as_str(), "1" | "true" | "yes");
        }
        Ok(cfg)
    }

    /// Whether any authentication is configured.
    #[must_use]
    pub fn auth_enabled(&self) -> bool {
        !self.auth_tokens.is_empty() || !self.auth_keys.is_empty()
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
