// SPDX-License-Identifier: MIT OR Apache-2.0
//! API error responses.
//!
//! Every failure answers with `{"error_code": …, "message": …}` and a
//! status code derived from the error's [`ErrorCode`].

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use spell_core::ErrorCode;

/// An API failure: stable code plus a single-line message.
#[derive(Debug, Clone)]
pub struct ApiError {
    /// Stable error code, also used to derive the HTTP status.
    pub code: ErrorCode,
    /// Single-line cause.
    pub message: String,
}

impl ApiError {
    /// Build an error from a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The HTTP status for this error's code.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self.code {
            ErrorCode::AuthRequired | ErrorCode::AuthInvalid => StatusCode::UNAUTHORIZED,
            ErrorCode::RoleNotAllowed
            | ErrorCode::TenantForbidden
            | ErrorCode::TenantNotAllowed
            | ErrorCode::AdminRoleRequired => StatusCode::FORBIDDEN,
            ErrorCode::NotFound | ErrorCode::OutputNotFound => StatusCode::NOT_FOUND,
            ErrorCode::AlreadyTerminal
            | ErrorCode::NotRetryable
            | ErrorCode::IdempotencyConflict => StatusCode::CONFLICT,
            ErrorCode::RateLimited
            | ErrorCode::TenantRateLimited
            | ErrorCode::ConcurrencyLimited
            | ErrorCode::TenantConcurrencyLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// 500 with a generic message, logging the detail.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        tracing::error!(error = %err, "internal API error");
        Self::new(ErrorCode::Internal, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error_code": self.code,
            "message": self.message,
        }));
        (self.status(), body).into_response()
    }
}
