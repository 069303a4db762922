//! # Shared Types
//!
//! Small data types that cross module boundaries: the caller identity that
//! authentication attaches to a request, and the header names the gateway
//! reads or writes on proxied traffic.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request};
use serde::{Deserialize, Serialize};

/// Version string injected into downstream requests and responses.
pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Header names used on proxied traffic.
pub mod headers {
    pub const USER_ID: &str = "x-user-id";
    pub const USER_ROLES: &str = "x-user-roles";
    pub const TRACE_ID: &str = "x-trace-id";
    pub const GATEWAY_VERSION: &str = "x-gateway-version";
    pub const TARGET_SERVICE: &str = "x-target-service";
    pub const RESPONSE_TIME: &str = "x-response-time";
    pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
    pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
    pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";
    pub const CACHE: &str = "x-cache";
    pub const FORWARDED_FOR: &str = "x-forwarded-for";
}

/// Roles the rate limiter and admin routes know about.
pub mod roles {
    pub const ADMIN: &str = "admin";
    pub const CUSTOMER: &str = "customer";
    pub const SYSTEM: &str = "system";
}

/// Verified identity of the caller, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: String,
    pub roles: Vec<String>,
}

impl AuthContext {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(roles::ADMIN)
    }
}

/// Best-effort client address: the first `X-Forwarded-For` hop when present,
/// otherwise the peer address of the connection.
pub fn client_ip(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get(headers::FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
