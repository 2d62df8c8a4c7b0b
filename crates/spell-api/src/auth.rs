// SPDX-License-Identifier: MIT OR Apache-2.0
//! Authentication and tenancy.
//!
//! Two optional modes compose: simple bearer tokens authenticate without
//! binding identity, and role-keyed tokens (`[tenant:]role=token`) bind
//! the caller's tenant and role. With role-keyed auth in effect, any
//! client-supplied tenant field is ignored.

use crate::config::ApiConfig;
use crate::error::ApiError;
use anyhow::{Result, bail};
use spell_core::ErrorCode;

/// Tenant used when nothing binds one.
pub const DEFAULT_TENANT: &str = "default";
/// Role allowed to read across tenants.
pub const ADMIN_ROLE: &str = "admin";

/// One parsed `[tenant:]role=token` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleKey {
    /// Bound tenant; `None` binds the default tenant.
    pub tenant: Option<String>,
    /// Bound role.
    pub role: String,
    /// The bearer token.
    pub token: String,
}

impl RoleKey {
    /// Parse `[tenant:]role=token`.
    pub fn parse(entry: &str) -> Result<Self> {
        let Some((head, token)) = entry.split_once('=') else {
            bail!("auth key '{entry}' must look like [tenant:]role=token");
        };
        if token.is_empty() {
            bail!("auth key '{entry}' has an empty token");
        }
        let (tenant, role) = match head.split_once(':') {
            Some((tenant, role)) => (Some(tenant.to_string()), role.to_string()),
            None => (None, head.to_string()),
        };
        if role.is_empty() {
            bail!("auth key '{entry}' has an empty role");
        }
        Ok(Self {
            tenant,
            role,
            token: token.to_string(),
        })
    }
}

/// The authenticated caller attached to each request.
#[derive(Debug, Clone)]
pub struct AuthPrincipal {
    /// Bound tenant, when role-keyed auth matched.
    pub tenant_id: Option<String>,
    /// Bound role, when role-keyed auth matched.
    pub role: Option<String>,
}

impl AuthPrincipal {
    /// An unbound principal (open mode or simple bearer token).
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            tenant_id: None,
            role: None,
        }
    }

    /// Whether role-keyed auth bound this caller's identity.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.role.is_some()
    }

    /// Whether the caller holds the admin role.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
    }

    /// The tenant this caller acts as, considering an optional
    /// client-supplied tenant (honoured only when identity is unbound).
    #[must_use]
    pub fn effective_tenant(&self, requested: Option<&str>) -> String {
        match &self.tenant_id {
            Some(bound) => bound.clone(),
            None => requested.unwrap_or(DEFAULT_TENANT).to_string(),
        }
    }

    /// The role this caller acts as, considering a client-supplied role.
    #[must_use]
    pub fn effective_role(&self, requested: Option<&str>) -> String {
        match &self.role {
            Some(bound) => bound.clone(),
            None => requested.unwrap_or("operator").to_string(),
        }
    }

    /// Whether the caller may read executions of `tenant`.
    #[must_use]
    pub fn may_read_tenant(&self, tenant: &str) -> bool {
        if !self.is_bound() || self.is_admin() {
            return true;
        }
        self.tenant_id.as_deref() == Some(tenant)
            || (self.tenant_id.is_none() && tenant == DEFAULT_TENANT)
    }
}

/// Authenticate a request's `Authorization: Bearer` header against the
/// configured token sets.
pub fn authenticate(
    config: &ApiConfig,
    authorization: Option<&str>,
) -> Result<AuthPrincipal, ApiError> {
    if !config.auth_enabled() {
        return Ok(AuthPrincipal::anonymous());
    }

    let Some(header) = authorization else {
        return Err(ApiError::new(
            ErrorCode::AuthRequired,
            "missing Authorization header",
        ));
    };
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .unwrap_or(header)
        .trim();

    if config.auth_tokens.iter().any(|t| t == token) {
        return Ok(AuthPrincipal::anonymous());
    }
    if let Some(key) = config.auth_keys.iter().find(|k| k.token == token) {
        return Ok(AuthPrincipal {
            tenant_id: Some(
                key.tenant
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TENANT.to_string()),
            ),
            role: Some(key.role.clone()),
        });
    }

    Err(ApiError::new(
        ErrorCode::AuthInvalid,
        "unrecognized bearer token",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_keys() -> ApiConfig {
        ApiConfig {
            auth_tokens: vec!["plain-token".to_string()],
            auth_keys: vec![
                RoleKey::parse("acme:operator=op-token").unwrap(),
                RoleKey::parse("acme:admin=admin-token").unwrap(),
                RoleKey::parse("viewer=viewer-token").unwrap(),
            ],
            ..ApiConfig::default()
        }
    }

    #[test]
    fn role_key_parsing() {
        let key = RoleKey::parse("acme:operator=tok").unwrap();
        assert_eq!(key.tenant.as_deref(), Some("acme"));
        assert_eq!(key.role, "operator");
        assert_eq!(key.token, "tok");

        let key = RoleKey::parse("admin=tok2").unwrap();
        assert!(key.tenant.is_none());
        assert_eq!(key.role, "admin");

        assert!(RoleKey::parse("no-equals").is_err());
        assert!(RoleKey::parse("role=").is_err());
        assert!(RoleKey::parse("=tok").is_err());
    }

    #[test]
    fn open_mode_accepts_everyone() {
        let principal = authenticate(&ApiConfig::default(), None).unwrap();
        assert!(!principal.is_bound());
    }

    #[test]
    fn missing_header_is_auth_required() {
        let err = authenticate(&config_with_keys(), None).unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthRequired);
    }

    #[test]
    fn bad_token_is_auth_invalid() {
        let err = authenticate(&config_with_keys(), Some("Bearer nope")).unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthInvalid);
    }

    #[test]
    fn simple_token_authenticates_without_binding() {
        let principal = authenticate(&config_with_keys(), Some("Bearer plain-token")).unwrap();
        assert!(!principal.is_bound());
        // Unbound callers may pick a tenant in the body.
        assert_eq!(principal.effective_tenant(Some("acme")), "acme");
    }

    #[test]
    fn role_key_binds_tenant_and_role() {
        let principal = authenticate(&config_with_keys(), Some("Bearer op-token")).unwrap();
        assert!(principal.is_bound());
        assert!(!principal.is_admin());
        // Client-supplied tenant is ignored once bound.
        assert_eq!(principal.effective_tenant(Some("other")), "acme");
        assert_eq!(principal.effective_role(Some("admin")), "operator");
    }

    #[test]
    fn tenant_read_rules() {
        let op = authenticate(&config_with_keys(), Some("Bearer op-token")).unwrap();
        assert!(op.may_read_tenant("acme"));
        assert!(!op.may_read_tenant("other"));

        let admin = authenticate(&config_with_keys(), Some("Bearer admin-token")).unwrap();
        assert!(admin.may_read_tenant("other"));

        let viewer = authenticate(&config_with_keys(), Some("Bearer viewer-token")).unwrap();
        assert!(viewer.may_read_tenant(DEFAULT_TENANT));
        assert!(!viewer.may_read_tenant("acme"));
    }
}
