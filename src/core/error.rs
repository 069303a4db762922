//! # Error Handling
//!
//! Every fallible operation in the gateway returns [`GatewayResult`]. The error
//! enum is built with `thiserror` so each variant carries its own `Display`
//! text, and it implements axum's [`IntoResponse`] so handlers can simply
//! return `Err(..)` and the caller receives a consistent JSON body:
//!
//! ```json
//! {"error": {"code": 503, "type": "circuit_breaker_open", "message": "...", "retryable": true}}
//! ```
//!
//! ## Error Taxonomy
//!
//! | Situation                          | Variant               | Status |
//! |------------------------------------|-----------------------|--------|
//! | no instance for a service          | `ServiceUnavailable`  | 503    |
//! | downstream did not answer in time  | `Timeout`             | 504    |
//! | downstream transport failure       | `BadGateway`          | 502    |
//! | too many requests for a key        | `RateLimitExceeded`   | 429    |
//! | breaker open for the service       | `CircuitBreakerOpen`  | 503    |
//!
//! Only the downstream failures (503/504/502) count against a circuit breaker;
//! rate limiting and client errors never do.

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Result alias used throughout the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// All errors the gateway can produce.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Invalid or inconsistent configuration.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Missing or invalid credentials.
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// Authenticated caller without the required role.
    #[error("Authorization failed: {reason}")]
    Authorization { reason: String },

    /// The caller exhausted its sliding window.
    #[error("Rate limit exceeded: {limit} requests per {window:?}")]
    RateLimitExceeded {
        limit: u64,
        window: Duration,
        retry_after: Duration,
    },

    /// Requests to the service are short-circuited.
    #[error("Circuit breaker is open for service: {service}")]
    CircuitBreakerOpen {
        service: String,
        retry_after: Duration,
    },

    /// No instance could be resolved for the service.
    #[error("Service unavailable: {service} - {reason}")]
    ServiceUnavailable { service: String, reason: String },

    /// Malformed input from the caller.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// No route prefix matches the request path.
    #[error("No route matches path: {path}")]
    RouteNotFound { path: String },

    /// The downstream call exceeded its deadline.
    #[error("Request to {service} timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },

    /// The downstream call failed at the transport level.
    #[error("Bad gateway for {service}: {reason}")]
    BadGateway { service: String, reason: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl GatewayError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    pub fn authz<S: Into<String>>(reason: S) -> Self {
        Self::Authorization {
            reason: reason.into(),
        }
    }

    pub fn service_unavailable<S: Into<String>, R: Into<String>>(service: S, reason: R) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code returned to the client for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication { .. } | Self::Jwt(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitBreakerOpen { .. } | Self::ServiceUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::BadGateway { .. } | Self::HttpClient(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidRequest { .. } | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::Configuration { .. } | Self::Internal { .. } | Self::Io(_) | Self::Yaml(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable error kind.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Authentication { .. } | Self::Jwt(_) => "authentication_error",
            Self::Authorization { .. } => "authorization_error",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::RouteNotFound { .. } => "route_not_found",
            Self::Timeout { .. } => "gateway_timeout",
            Self::BadGateway { .. } | Self::HttpClient(_) => "bad_gateway",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Json(_) => "invalid_json",
            Self::Internal { .. } | Self::Io(_) | Self::Yaml(_) => "internal_error",
        }
    }

    /// Whether a client may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. }
                | Self::CircuitBreakerOpen { .. }
                | Self::ServiceUnavailable { .. }
                | Self::Timeout { .. }
                | Self::BadGateway { .. }
                | Self::HttpClient(_)
        )
    }

    /// Retry hint carried by rejection variants.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. }
            | Self::CircuitBreakerOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Seconds to advertise in `Retry-After`, never less than one.
pub(crate) fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after().map(retry_after_secs);

        let mut error = json!({
            "code": status.as_u16(),
            "type": self.error_type(),
            "message": self.to_string(),
            "retryable": self.is_retryable(),
        });
        if let Some(secs) = retry_after {
            error["retry_after"] = json!(secs);
        }

        let mut response = (status, Json(json!({ "error": error }))).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}
