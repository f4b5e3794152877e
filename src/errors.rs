use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// The crate-wide error type. Variants map directly to the response
/// disposition table (spec §4.1.3) and the error-kind contract (§7) — every
/// one of them is a policy/control-plane outcome the caller is meant to see,
/// not an implementation accident.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("session is paused")]
    SessionPaused,

    #[error("policy denied: {reason}")]
    PolicyDenied { policy: String, reason: String },

    #[error("policy terminated session: {reason}")]
    PolicyTerminated { policy: String, reason: String },

    #[error("approval timed out")]
    ApprovalTimeout,

    #[error("approval rejected")]
    ApprovalRejected,

    #[error("kill switch active: {0}")]
    KillSwitchActive(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("request invalid: {0}")]
    InvalidRequest(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("approval not found or not pending: {0}")]
    ApprovalNotPending(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// The trace id attached to the response, when the caller supplies one
    /// — every error path except request-validation failures still has an
    /// associated trace, per spec §7 ("every user-visible failure mode has
    /// an audit record").
    pub fn with_trace(self, trace_id: impl Into<String>) -> (Response, String) {
        let trace_id = trace_id.into();
        let mut response = self.into_response();
        if let Ok(value) = axum::http::HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert("x-trace-id", value);
        }
        (response, trace_id)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, msg) = match &self {
            AppError::SessionPaused => (
                StatusCode::SERVICE_UNAVAILABLE,
                "session_paused",
                "session is paused".to_string(),
            ),
            AppError::PolicyDenied { policy, reason } => (
                StatusCode::FORBIDDEN,
                "policy_deny",
                format!("blocked by policy '{policy}': {reason}"),
            ),
            AppError::PolicyTerminated { policy, reason } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "policy_terminate",
                format!("session terminated by policy '{policy}': {reason}"),
            ),
            AppError::ApprovalTimeout => (
                StatusCode::FORBIDDEN,
                "policy_deny",
                "approval timed out".to_string(),
            ),
            AppError::ApprovalRejected => (
                StatusCode::FORBIDDEN,
                "policy_deny",
                "action rejected by approver".to_string(),
            ),
            AppError::KillSwitchActive(reason) => {
                (StatusCode::SERVICE_UNAVAILABLE, "killswitch", reason.clone())
            }
            AppError::UpstreamError(msg) => {
                (StatusCode::BAD_GATEWAY, "upstream_error", msg.clone())
            }
            AppError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                "request body exceeds the configured size limit".to_string(),
            ),
            AppError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg.clone())
            }
            AppError::SessionNotFound(id) => (
                StatusCode::NOT_FOUND,
                "session_not_found",
                format!("no session with id '{id}'"),
            ),
            AppError::ApprovalNotPending(id) => (
                StatusCode::CONFLICT,
                "approval_not_pending",
                format!("approval '{id}' is not pending"),
            ),
            AppError::Database(e) => {
                tracing::error!(error = %e, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = match &self {
            AppError::PolicyDenied { policy, .. } => json!({
                "error": {"code": code, "message": msg, "policy": policy, "effect": "deny"},
            }),
            AppError::PolicyTerminated { policy, .. } => json!({
                "error": {"code": code, "message": msg, "policy": policy, "effect": "terminate"},
            }),
            _ => json!({"error": {"code": code, "message": msg}}),
        };

        (status, Json(body)).into_response()
    }
}
