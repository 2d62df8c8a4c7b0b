// SPDX-License-Identifier: MIT OR Apache-2.0
//! Router, handlers, and the execution driver.
//!
//! Middleware order: auth → rate limiting → (handler-level) idempotency →
//! concurrency caps → submission. Execution runs on a spawned task that
//! publishes every state transition to the event bus, appends the tenant
//! audit line, and persists the index before answering any reader.

use crate::audit::{self, AuditEntry};
use crate::auth::{AuthPrincipal, authenticate};
use crate::buttons::{Button, ButtonRegistry};
use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::events::EventBus;
use crate::index::{
    Confirmation, ExecutionIndex, ExecutionRecord, ExecutionStatus, IdempotencyEntry, ListFilter,
    body_fingerprint,
};
use crate::limits::SlidingWindow;
use axum::extract::{DefaultBodyLimit, Path as AxPath, Query, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use spell_core::ErrorCode;
use spell_core::outputs::{OutputRefError, resolve_output_reference};
use spell_engine::{CancelToken, CastOptions, cast};
use spell_store::{RuntimeLimits, SpellHome, SpellStore};
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Shared server state.
pub struct ApiState {
    /// Persistent layout root.
    pub home: SpellHome,
    /// Resolved configuration.
    pub config: ApiConfig,
    /// Immutable button registry, loaded at startup.
    pub buttons: ButtonRegistry,
    /// Persisted execution index.
    pub index: ExecutionIndex,
    /// Event bus feeding the SSE streams.
    pub bus: EventBus,
    global_rate: SlidingWindow,
    tenant_rate: SlidingWindow,
    live: Mutex<HashMap<String, CancelToken>>,
}

impl ApiState {
    /// Build state: load the button registry and rebuild the index.
    pub fn new(home: SpellHome, config: ApiConfig) -> anyhow::Result<Arc<Self>> {
        let buttons_path = std::env::var("SPELL_BUTTONS_FILE")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| home.buttons_path());
        let buttons = ButtonRegistry::load(&buttons_path)?;
        let index = ExecutionIndex::open(home.index_path())?;
        let global_rate = SlidingWindow::new(
            Duration::from_millis(config.rate_limit_window_ms),
            config.rate_limit_max_requests,
        );
        let tenant_rate = SlidingWindow::new(
            Duration::from_millis(config.tenant_rate_limit_window_ms),
            config.tenant_rate_limit_max_requests,
        );
        info!(buttons = buttons.buttons.len(), "API state initialized");
        Ok(Arc::new(Self {
            home,
            config,
            buttons,
            index,
            bus: EventBus::new(),
            global_rate,
            tenant_rate,
            live: Mutex::new(HashMap::new()),
        }))
    }

    async fn transition(
        &self,
        execution_id: &str,
        apply: impl FnOnce(&mut ExecutionRecord),
    ) -> anyhow::Result<Option<ExecutionRecord>> {
        let updated = self.index.update(execution_id, apply).await?;
        if let Some(record) = &updated {
            if let Err(e) = audit::append(&self.home.audit_path(), &AuditEntry::from_record(record))
            {
                warn!(error = %e, "failed to append tenant audit line");
            }
            self.bus.publish(record);
        }
        Ok(updated)
    }
}

/// Build the router with all middleware and routes.
pub fn build_app(state: Arc<ApiState>) -> Router {
    let body_limit = state.config.body_limit_bytes;
    Router::new()
        .route("/api/buttons", get(list_buttons))
        .route("/api/spell-executions", post(submit).get(list_executions))
        .route("/api/spell-executions/events", get(list_events))
        .route("/api/spell-executions/{id}", get(get_execution))
        .route("/api/spell-executions/{id}/output", get(get_output))
        .route("/api/spell-executions/{id}/events", get(execution_events))
        .route("/api/spell-executions/{id}/cancel", post(cancel_execution))
        .route("/api/spell-executions/{id}/retry", post(retry_execution))
        .route("/api/tenants/{tenant_id}/usage", get(tenant_usage))
        .route("/", get(ui_index))
        .route("/ui/{*path}", get(ui_index))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_and_rate_middleware,
        ))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Bind the listener and serve until shutdown. `port = 0` requests an
/// ephemeral port.
pub async fn serve(home: SpellHome, config: ApiConfig) -> anyhow::Result<()> {
    let port = config.port;
    let state = ApiState::new(home, config)?;
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "spell execution API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn auth_and_rate_middleware(
    State(state): State<Arc<ApiState>>,
    mut request: axum::extract::Request,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let principal = match authenticate(&state.config, authorization.as_deref()) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };

    if !state.global_rate.check_global() {
        return ApiError::new(ErrorCode::RateLimited, "request rate exceeded").into_response();
    }
    let tenant_key = principal.effective_tenant(None);
    if !state.tenant_rate.check_key(&tenant_key) {
        return ApiError::new(
            ErrorCode::TenantRateLimited,
            format!("request rate exceeded for tenant {tenant_key}"),
        )
        .into_response();
    }

    request.extensions_mut().insert(principal);
    next.run(request).await
}

// ---------------------------------------------------------------------------
// Buttons
// ---------------------------------------------------------------------------

async fn list_buttons(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let buttons: Vec<Value> = state
        .buttons
        .buttons
        .iter()
        .map(|(id, button)| {
            json!({
                "button_id": id,
                "spell_id": button.spell_id,
                "version": button.version,
                "allowed_roles": button.allowed_roles,
                "required_confirmations": button.required_confirmations,
                "require_signature": button.require_signature,
            })
        })
        .collect();
    Json(json!({ "buttons": buttons }))
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Submission body. `button_id` is the only way to name a spell; unknown
/// fields (e.g. `spell_id`) are rejected outright.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmitRequest {
    button_id: String,
    #[serde(default)]
    actor_role: Option<String>,
    #[serde(default)]
    input: Option<Map<String, Value>>,
    #[serde(default)]
    dry_run: Option<bool>,
    #[serde(default)]
    confirmation: Option<Confirmation>,
    // Accepted but ignored whenever role-keyed auth binds the caller.
    #[serde(default)]
    tenant: Option<String>,
    #[serde(default)]
    tenant_id: Option<String>,
}

async fn submit(
    State(state): State<Arc<ApiState>>,
    axum::Extension(principal): axum::Extension<AuthPrincipal>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let request: SubmitRequest = serde_json::from_value(body.clone())
        .map_err(|e| ApiError::new(ErrorCode::BadRequest, format!("invalid submission: {e}")))?;

    let Some(button) = state.buttons.get(&request.button_id) else {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("unknown button '{}'", request.button_id),
        ));
    };

    let role = principal.effective_role(request.actor_role.as_deref());
    if !button.allowed_roles.iter().any(|r| r == &role) {
        return Err(ApiError::new(
            ErrorCode::RoleNotAllowed,
            format!("role '{role}' may not use button '{}'", request.button_id),
        ));
    }

    let requested_tenant = request.tenant_id.as_deref().or(request.tenant.as_deref());
    let tenant = principal.effective_tenant(requested_tenant);
    if let Some(allowed) = &button.allowed_tenants {
        if !allowed.iter().any(|t| t == &tenant) {
            return Err(ApiError::new(
                ErrorCode::TenantNotAllowed,
                format!("tenant '{tenant}' may not use button '{}'", request.button_id),
            ));
        }
    }

    let confirmation = request.confirmation.unwrap_or_default();
    if button.required_confirmations.risk && !confirmation.risk_acknowledged {
        return Err(ApiError::new(
            ErrorCode::RiskConfirmationRequired,
            "button requires confirmation.risk_acknowledged",
        ));
    }
    if button.required_confirmations.billing && !confirmation.billing_acknowledged {
        return Err(ApiError::new(
            ErrorCode::BillingNotAllowed,
            "button requires confirmation.billing_acknowledged",
        ));
    }

    // Idempotency: same key + same body replays; different body conflicts.
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(key) = &idempotency_key {
        if let Some(entry) = state.index.idempotency_get(key).await {
            if entry.body_hash == body_fingerprint(&body) {
                return Ok((
                    axum::http::StatusCode::ACCEPTED,
                    Json(json!({
                        "execution_id": entry.execution_id,
                        "idempotent_replay": true,
                    })),
                )
                    .into_response());
            }
            return Err(ApiError::new(
                ErrorCode::IdempotencyConflict,
                format!("idempotency key '{key}' was used with a different body"),
            ));
        }
    }

    // In-flight caps.
    if state.index.in_flight(None).await >= state.config.max_concurrent_executions {
        return Err(ApiError::new(
            ErrorCode::ConcurrencyLimited,
            "too many in-flight executions",
        ));
    }
    if state.index.in_flight(Some(&tenant)).await
        >= state.config.tenant_max_concurrent_executions
    {
        return Err(ApiError::new(
            ErrorCode::TenantConcurrencyLimited,
            format!("too many in-flight executions for tenant {tenant}"),
        ));
    }

    // Resolve the spell now so the execution id and version are stable.
    let store = SpellStore::new(state.home.clone());
    let bundle = store
        .resolve(&button.spell_id, button.version.as_deref())
        .map_err(|e| {
            ApiError::new(
                ErrorCode::BadRequest,
                format!("button spell unavailable: {e}"),
            )
        })?;

    let now = Utc::now();
    let execution_id =
        unique_execution_id(&state, &bundle.manifest.id, &bundle.manifest.version, now).await;

    // The index is persisted and served back to callers; sensitive input
    // keys never reach it in plaintext.
    let mut merged_value = Value::Object(button.merged_input(request.input.as_ref()));
    let secrets = spell_core::redact::sensitive_env_values(std::env::vars());
    spell_core::redact::redact_value(&mut merged_value, &secrets);
    let merged_input = merged_value.as_object().cloned().unwrap_or_default();

    let record = ExecutionRecord {
        execution_id: execution_id.clone(),
        button_id: request.button_id.clone(),
        spell_id: button.spell_id.clone(),
        spell_version: Some(bundle.manifest.version.clone()),
        tenant_id: tenant,
        actor_role: role,
        status: ExecutionStatus::Queued,
        error_code: None,
        error: None,
        created_at: now,
        updated_at: now,
        retry_of: None,
        retried_by: None,
        idempotency_key: idempotency_key.clone(),
        dry_run: request.dry_run.unwrap_or(false),
        input: merged_input,
        confirmation,
    };

    state
        .index
        .insert(record.clone())
        .await
        .map_err(ApiError::internal)?;
    if let Err(e) = audit::append(&state.home.audit_path(), &AuditEntry::from_record(&record)) {
        warn!(error = %e, "failed to append tenant audit line");
    }
    state.bus.publish(&record);

    if let Some(key) = &idempotency_key {
        state
            .index
            .idempotency_put(
                key,
                IdempotencyEntry {
                    execution_id: execution_id.clone(),
                    body_hash: body_fingerprint(&body),
                },
            )
            .await
            .map_err(ApiError::internal)?;
    }

    spawn_driver(state.clone(), record, button.clone());

    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(json!({ "execution_id": execution_id })),
    )
        .into_response())
}

/// Execution ids carry second precision; disambiguate same-second
/// submissions of the same spell.
async fn unique_execution_id(
    state: &ApiState,
    spell_id: &str,
    version: &str,
    now: DateTime<Utc>,
) -> String {
    let base = spell_core::execution_id(spell_id, version, now);
    if state.index.get(&base).await.is_none() {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if state.index.get(&candidate).await.is_none() {
            return candidate;
        }
        n += 1;
    }
}

fn spawn_driver(state: Arc<ApiState>, record: ExecutionRecord, button: Button) {
    tokio::spawn(async move {
        if let Err(e) = drive_execution(&state, record, &button).await {
            error!(error = %e, "execution driver failed");
        }
    });
}

async fn drive_execution(
    state: &Arc<ApiState>,
    record: ExecutionRecord,
    button: &Button,
) -> anyhow::Result<()> {
    let execution_id = record.execution_id.clone();

    let token = CancelToken::new();
    state
        .live
        .lock()
        .await
        .insert(execution_id.clone(), token.clone());

    // A cancel that lands while queued prevents any step from starting:
    // the guarded transition refuses to leave a terminal state.
    let updated = state
        .transition(&execution_id, |r| {
            if !r.status.is_terminal() {
                r.status = ExecutionStatus::Running;
            }
        })
        .await?;
    if !matches!(
        updated.map(|r| r.status),
        Some(ExecutionStatus::Running)
    ) {
        state.live.lock().await.remove(&execution_id);
        return Ok(());
    }

    let limits = RuntimeLimits::from_env().unwrap_or_default();
    let options = CastOptions {
        id: record.spell_id.clone(),
        version: record.spell_version.clone(),
        input_json: Some(Value::Object(record.input.clone()).to_string()),
        params: Vec::new(),
        dry_run: record.dry_run,
        yes: record.confirmation.risk_acknowledged,
        allow_billing: record.confirmation.billing_acknowledged,
        require_signature: button.require_signature || state.config.force_require_signature,
        allow_unsigned: false,
        limits,
        execution_id: Some(execution_id.clone()),
    };

    let outcome = cast(&state.home, &options, &token).await;
    state.live.lock().await.remove(&execution_id);

    let (status, error_code, error) = match &outcome {
        Ok(outcome) => match &outcome.failure {
            None => (ExecutionStatus::Succeeded, None, None),
            Some(f) if f.canceled => (ExecutionStatus::Canceled, None, Some(f.message.clone())),
            Some(f) if f.code == Some(ErrorCode::ExecutionTimeout) => (
                ExecutionStatus::Timeout,
                f.code,
                Some(f.message.clone()),
            ),
            Some(f) => (ExecutionStatus::Failed, f.code, Some(f.message.clone())),
        },
        Err(e) => (
            ExecutionStatus::Failed,
            Some(ErrorCode::Internal),
            Some(format!("{e:#}")),
        ),
    };

    // The receipt write happened inside `cast`; only now does the terminal
    // status become visible to readers.
    state
        .transition(&execution_id, |r| {
            if !r.status.is_terminal() {
                r.status = status;
                r.error_code = error_code;
                r.error = error;
            }
        })
        .await?;

    state
        .index
        .prune(
            &state.home.logs_dir(),
            state.config.log_max_files,
            state.config.log_retention_days,
        )
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Listing and detail
// ---------------------------------------------------------------------------

fn parse_filter(
    params: &HashMap<String, String>,
    principal: &AuthPrincipal,
) -> Result<ListFilter, ApiError> {
    let mut filter = ListFilter::default();
    if let Some(raw) = params.get("status") {
        filter.status = Some(
            serde_json::from_value(Value::String(raw.clone())).map_err(|_| {
                ApiError::new(ErrorCode::InvalidQuery, format!("unknown status '{raw}'"))
            })?,
        );
    }
    filter.button_id = params.get("button_id").cloned();
    filter.spell_id = params.get("spell_id").cloned();
    for (key, slot) in [("from", &mut filter.from), ("to", &mut filter.to)] {
        if let Some(raw) = params.get(key) {
            let parsed = DateTime::parse_from_rfc3339(raw).map_err(|_| {
                ApiError::new(
                    ErrorCode::InvalidQuery,
                    format!("{key} must be ISO-8601, got '{raw}'"),
                )
            })?;
            *slot = Some(parsed.with_timezone(&Utc));
        }
    }
    if let Some(raw) = params.get("limit") {
        let limit: usize = raw.parse().map_err(|_| {
            ApiError::new(ErrorCode::InvalidQuery, format!("bad limit '{raw}'"))
        })?;
        filter.limit = Some(limit);
    }

    // Tenant scoping: bound non-admin callers only ever see their own
    // tenant; admins may select any tenant explicitly.
    let requested = params.get("tenant_id").cloned();
    if principal.is_bound() && !principal.is_admin() {
        let own = principal.effective_tenant(None);
        if let Some(requested) = &requested {
            if requested != &own {
                return Err(ApiError::new(
                    ErrorCode::TenantForbidden,
                    "cross-tenant reads require the admin role",
                ));
            }
        }
        filter.tenant_id = Some(own);
    } else {
        filter.tenant_id = requested;
    }
    Ok(filter)
}

async fn list_executions(
    State(state): State<Arc<ApiState>>,
    axum::Extension(principal): axum::Extension<AuthPrincipal>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let filter = parse_filter(&params, &principal)?;
    let executions = state.index.list(&filter).await;
    Ok(Json(json!({ "executions": executions })))
}

fn guard_read(principal: &AuthPrincipal, record: &ExecutionRecord) -> Result<(), ApiError> {
    if principal.may_read_tenant(&record.tenant_id) {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorCode::TenantForbidden,
            "execution belongs to another tenant",
        ))
    }
}

fn load_receipt(state: &ApiState, execution_id: &str) -> Option<Value> {
    let path = state.home.receipt_path(execution_id);
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Strip `stdout_head`/`stderr_head` from every step of an API-facing
/// receipt.
fn sanitize_receipt(mut receipt: Value) -> Value {
    if let Some(steps) = receipt.get_mut("steps").and_then(Value::as_array_mut) {
        for step in steps {
            if let Some(map) = step.as_object_mut() {
                map.remove("stdout_head");
                map.remove("stderr_head");
            }
        }
    }
    receipt
}

async fn get_execution(
    State(state): State<Arc<ApiState>>,
    axum::Extension(principal): axum::Extension<AuthPrincipal>,
    AxPath(id): AxPath<String>,
) -> Result<Json<Value>, ApiError> {
    let Some(record) = state.index.get(&id).await else {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("unknown execution '{id}'"),
        ));
    };
    guard_read(&principal, &record)?;
    let receipt = load_receipt(&state, &id).map(sanitize_receipt);
    Ok(Json(json!({ "execution": record, "receipt": receipt })))
}

#[derive(Debug, Deserialize)]
struct OutputQuery {
    path: Option<String>,
}

async fn get_output(
    State(state): State<Arc<ApiState>>,
    axum::Extension(principal): axum::Extension<AuthPrincipal>,
    AxPath(id): AxPath<String>,
    Query(query): Query<OutputQuery>,
) -> Result<Json<Value>, ApiError> {
    let Some(record) = state.index.get(&id).await else {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("unknown execution '{id}'"),
        ));
    };
    guard_read(&principal, &record)?;
    let Some(path) = query.path else {
        return Err(ApiError::new(
            ErrorCode::BadRequest,
            "missing ?path= query parameter",
        ));
    };

    let receipt = load_receipt(&state, &id).ok_or_else(|| {
        ApiError::new(ErrorCode::NotFound, format!("no receipt for '{id}'"))
    })?;
    let outputs: Map<String, Value> = receipt
        .get("outputs")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    match resolve_output_reference(&outputs, &path) {
        Ok(value) => Ok(Json(json!({ "path": path, "value": value }))),
        Err(OutputRefError::NotFound { .. }) => Err(ApiError::new(
            ErrorCode::OutputNotFound,
            format!("output reference not found: {path}"),
        )),
        Err(e) => Err(ApiError::new(ErrorCode::InvalidOutputPath, e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Cancel and retry
// ---------------------------------------------------------------------------

async fn cancel_execution(
    State(state): State<Arc<ApiState>>,
    axum::Extension(principal): axum::Extension<AuthPrincipal>,
    AxPath(id): AxPath<String>,
) -> Result<Json<Value>, ApiError> {
    let Some(record) = state.index.get(&id).await else {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("unknown execution '{id}'"),
        ));
    };
    guard_read(&principal, &record)?;
    if record.status.is_terminal() {
        return Err(ApiError::new(
            ErrorCode::AlreadyTerminal,
            format!("execution '{id}' already terminated"),
        ));
    }

    // Abort in-flight work; a queued execution simply never starts.
    {
        let live = state.live.lock().await;
        if let Some(token) = live.get(&id) {
            token.cancel();
        }
    }
    let updated = state
        .transition(&id, |r| {
            if !r.status.is_terminal() {
                r.status = ExecutionStatus::Canceled;
                r.error = Some("canceled by caller".to_string());
            }
        })
        .await
        .map_err(ApiError::internal)?;

    info!(execution_id = %id, "execution canceled");
    Ok(Json(json!({
        "execution_id": id,
        "status": updated.map(|r| r.status).unwrap_or(ExecutionStatus::Canceled),
    })))
}

async fn retry_execution(
    State(state): State<Arc<ApiState>>,
    axum::Extension(principal): axum::Extension<AuthPrincipal>,
    AxPath(id): AxPath<String>,
) -> Result<Response, ApiError> {
    let Some(record) = state.index.get(&id).await else {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("unknown execution '{id}'"),
        ));
    };
    guard_read(&principal, &record)?;
    if !record.status.is_retryable() {
        return Err(ApiError::new(
            ErrorCode::NotRetryable,
            format!("execution '{id}' is not failed, timed out, or canceled"),
        ));
    }
    let Some(button) = state.buttons.get(&record.button_id) else {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("button '{}' no longer exists", record.button_id),
        ));
    };

    let now = Utc::now();
    let new_id = unique_execution_id(
        &state,
        &record.spell_id,
        record.spell_version.as_deref().unwrap_or("latest"),
        now,
    )
    .await;
    let retry = ExecutionRecord {
        execution_id: new_id.clone(),
        status: ExecutionStatus::Queued,
        error_code: None,
        error: None,
        created_at: now,
        updated_at: now,
        retry_of: Some(id.clone()),
        retried_by: None,
        idempotency_key: None,
        ..record.clone()
    };

    state
        .index
        .insert(retry.clone())
        .await
        .map_err(ApiError::internal)?;
    state
        .transition(&id, |r| r.retried_by = Some(new_id.clone()))
        .await
        .map_err(ApiError::internal)?;
    if let Err(e) = audit::append(&state.home.audit_path(), &AuditEntry::from_record(&retry)) {
        warn!(error = %e, "failed to append tenant audit line");
    }
    state.bus.publish(&retry);
    spawn_driver(state.clone(), retry, button.clone());

    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(json!({ "execution_id": new_id, "retry_of": id })),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

async fn tenant_usage(
    State(state): State<Arc<ApiState>>,
    axum::Extension(principal): axum::Extension<AuthPrincipal>,
    AxPath(tenant_id): AxPath<String>,
) -> Result<Json<Value>, ApiError> {
    if principal.is_bound() && !principal.is_admin() {
        return Err(ApiError::new(
            ErrorCode::AdminRoleRequired,
            "tenant usage requires the admin role",
        ));
    }
    let queued = state
        .index
        .list(&ListFilter {
            status: Some(ExecutionStatus::Queued),
            tenant_id: Some(tenant_id.clone()),
            ..ListFilter::default()
        })
        .await
        .len();
    let running = state
        .index
        .list(&ListFilter {
            status: Some(ExecutionStatus::Running),
            tenant_id: Some(tenant_id.clone()),
            ..ListFilter::default()
        })
        .await
        .len();
    let submissions = state
        .index
        .submissions_since(&tenant_id, Utc::now() - chrono::Duration::hours(24))
        .await;
    Ok(Json(json!({
        "tenant_id": tenant_id,
        "queued": queued,
        "running": running,
        "submissions_last_24h": submissions,
    })))
}

// ---------------------------------------------------------------------------
// SSE streams
// ---------------------------------------------------------------------------

fn record_event(name: &'static str, record: &ExecutionRecord) -> SseEvent {
    SseEvent::default()
        .event(name)
        .data(serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string()))
}

struct StreamState {
    rx: broadcast::Receiver<ExecutionRecord>,
    pending: VecDeque<SseEvent>,
    done: bool,
    filter: ListFilter,
    only_execution: Option<String>,
}

fn sse_stream(state: StreamState) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    futures::stream::unfold(state, |mut st| async move {
        if let Some(event) = st.pending.pop_front() {
            return Some((Ok(event), st));
        }
        if st.done {
            return None;
        }
        loop {
            match st.rx.recv().await {
                Ok(record) => {
                    if let Some(id) = &st.only_execution {
                        if &record.execution_id != id {
                            continue;
                        }
                        if record.status.is_terminal() {
                            st.done = true;
                            return Some((Ok(record_event("terminal", &record)), st));
                        }
                        return Some((Ok(record_event("update", &record)), st));
                    }
                    if st.filter.matches(&record) {
                        return Some((Ok(record_event("executions", &record)), st));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(dropped = n, "SSE subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

async fn list_events(
    State(state): State<Arc<ApiState>>,
    axum::Extension(principal): axum::Extension<AuthPrincipal>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let filter = parse_filter(&params, &principal)?;
    let snapshot = state.index.list(&filter).await;
    let mut pending = VecDeque::new();
    pending.push_back(
        SseEvent::default()
            .event("snapshot")
            .data(serde_json::to_string(&snapshot).unwrap_or_else(|_| "[]".to_string())),
    );

    let stream = sse_stream(StreamState {
        rx: state.bus.subscribe(),
        pending,
        done: false,
        filter,
        only_execution: None,
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn execution_events(
    State(state): State<Arc<ApiState>>,
    axum::Extension(principal): axum::Extension<AuthPrincipal>,
    AxPath(id): AxPath<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let Some(record) = state.index.get(&id).await else {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("unknown execution '{id}'"),
        ));
    };
    guard_read(&principal, &record)?;

    let rx = state.bus.subscribe();
    let mut pending = VecDeque::new();
    let mut done = false;
    pending.push_back(record_event("snapshot", &record));
    if record.status.is_terminal() {
        pending.push_back(record_event("terminal", &record));
        done = true;
    }

    let stream = sse_stream(StreamState {
        rx,
        pending,
        done,
        filter: ListFilter::default(),
        only_execution: Some(id),
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ---------------------------------------------------------------------------
// UI
// ---------------------------------------------------------------------------

async fn ui_index() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>spell</title></head>\
         <body><h1>spell execution API</h1>\
         <p>See <code>/api/buttons</code> and <code>/api/spell-executions</code>.</p>\
         </body></html>",
    )
}
