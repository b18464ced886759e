//! Error taxonomy
//! Mission: one typed error surface for the whole control-plane, mapped to
//! the `{success, data|error, timestamp}` envelope at the ingress boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

/// `BudgetExceeded` carries which window was violated; `SuspiciousActivityBlocked`
/// carries the reason strings so clients can show something actionable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("authentication required")]
    Unauthenticated,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found")]
    NotFound,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("emergency stop active")]
    EmergencyStopActive,
    #[error("budget exceeded: {window}")]
    BudgetExceeded { window: String },
    #[error("needs verification")]
    NeedsVerification,
    #[error("suspicious activity blocked")]
    SuspiciousActivityBlocked { reasons: Vec<String> },
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),
    #[error("upstream bad response: {0}")]
    UpstreamBadResponse(String),
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::EmergencyStopActive => StatusCode::FORBIDDEN,
            ApiError::BudgetExceeded { .. } => StatusCode::BAD_REQUEST,
            ApiError::NeedsVerification => StatusCode::FORBIDDEN,
            ApiError::SuspiciousActivityBlocked { .. } => StatusCode::FORBIDDEN,
            ApiError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::UpstreamBadResponse(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound => "not_found",
            ApiError::PayloadTooLarge => "payload_too_large",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Configuration(_) => "configuration_error",
            ApiError::Conflict(_) => "conflict",
            ApiError::EmergencyStopActive => "emergency_stop_active",
            ApiError::BudgetExceeded { .. } => "budget_exceeded",
            ApiError::NeedsVerification => "needs_verification",
            ApiError::SuspiciousActivityBlocked { .. } => "suspicious_activity_blocked",
            ApiError::UpstreamUnavailable(_) => "upstream_unavailable",
            ApiError::UpstreamTimeout(_) => "upstream_timeout",
            ApiError::UpstreamBadResponse(_) => "upstream_bad_response",
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// In production mode the message must never leak internals (stack
    /// traces, file paths). Everything else is shown verbatim.
    fn public_message(&self, production: bool) -> String {
        match self {
            ApiError::Internal(_) if production => "an internal error occurred".to_string(),
            ApiError::Configuration(_) if production => "service misconfigured".to_string(),
            other => other.to_string(),
        }
    }

    fn extra_data(&self) -> Option<Value> {
        match self {
            ApiError::BudgetExceeded { window } => Some(json!({ "window": window })),
            ApiError::SuspiciousActivityBlocked { reasons } => Some(json!({ "reasons": reasons })),
            _ => None,
        }
    }

    /// Render the standard response envelope. `correlation_id` and `production`
    /// are threaded in by the ingress pipeline's panic/error boundary.
    pub fn into_envelope(self, correlation_id: &str, production: bool) -> Response {
        let status = self.status();
        let retry_after = match &self {
            ApiError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        let mut body = json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.public_message(production),
            },
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(extra) = self.extra_data() {
            body["error"]["data"] = extra;
        }
        let mut response = (status, Json(body)).into_response();
        response
            .headers_mut()
            .insert("X-Request-ID", correlation_id.parse().unwrap());
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert("Retry-After", secs.to_string().parse().unwrap());
        }
        response
    }
}

/// Default rendering (no correlation id / production flag available, e.g.
/// from a handler that returns `Result<_, ApiError>` directly). Prefer
/// routing through the ingress panic boundary's `into_envelope` where a
/// correlation id is in scope.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.into_envelope("unknown", true)
    }
}

/// Translate a transport-level failure from the dispatcher into the
/// typed taxonomy.
pub fn translate_transport_error(err: &reqwest::Error) -> ApiError {
    if err.is_timeout() {
        return ApiError::UpstreamTimeout(err.to_string());
    }
    if err.is_connect() {
        return ApiError::UpstreamUnavailable(err.to_string());
    }
    ApiError::UpstreamBadResponse(err.to_string())
}

#[derive(Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    pub data: T,
    pub timestamp: String,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
            timestamp: Utc::now().to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(ApiError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::PayloadTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            ApiError::RateLimited { retry_after_secs: 5 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::UpstreamTimeout("x".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::UpstreamUnavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::UpstreamBadResponse("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn production_mode_hides_internal_message() {
        let err = ApiError::Internal("leaked stack trace at /src/foo.rs:12".into());
        assert_eq!(err.public_message(true), "an internal error occurred");
        assert!(err.public_message(false).contains("leaked"));
    }
}
