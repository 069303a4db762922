//! # Edge Protection
//!
//! Response security headers, CORS and the trusted-host check that sit at
//! the outer edge of the middleware stack.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{
    REFERRER_POLICY, STRICT_TRANSPORT_SECURITY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tower::layer::util::{Identity, Stack};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::warn;

/// Host names accepted in the `Host` header. Empty means any host.
#[derive(Debug, Clone, Default)]
pub struct AllowedHosts(Vec<String>);

impl AllowedHosts {
    pub fn new(hosts: &[String]) -> Self {
        Self(hosts.iter().map(|h| h.to_ascii_lowercase()).collect())
    }

    pub fn permits(&self, host_header: Option<&str>) -> bool {
        if self.0.is_empty() {
            return true;
        }
        let Some(host) = host_header else {
            return false;
        };
        let host = strip_port(host).to_ascii_lowercase();
        self.0.iter().any(|allowed| {
            allowed == "*"
                || *allowed == host
                || allowed
                    .strip_prefix("*.")
                    .is_some_and(|suffix| host.ends_with(&format!(".{}", suffix)))
        })
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split(']').next().map(|h| &h[1..]).unwrap_or(host);
    }
    host.rsplit_once(':').map(|(name, _)| name).unwrap_or(host)
}

pub async fn trusted_host_middleware(
    State(allowed): State<Arc<AllowedHosts>>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host());

    if !allowed.permits(host) {
        warn!(host = ?host, "Rejected request for untrusted host");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": {
                    "code": 400,
                    "type": "invalid_host",
                    "message": "Invalid host header",
                    "retryable": false
                }
            })),
        )
            .into_response();
    }
    next.run(request).await
}

/// CORS policy for the configured origins. `*` or an empty list allows any
/// origin.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let layer = CorsLayer::new().allow_methods(methods).allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

type HeaderLayer = SetResponseHeaderLayer<HeaderValue>;

/// Security headers added to every response unless the backend set them.
pub fn security_headers(
) -> ServiceBuilder<Stack<HeaderLayer, Stack<HeaderLayer, Stack<HeaderLayer, Stack<HeaderLayer, Identity>>>>>
{
    ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::if_not_present(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_allow_list_permits_everything() {
        let hosts = AllowedHosts::default();
        assert!(hosts.permits(None));
        assert!(hosts.permits(Some("evil.example")));
    }

    #[test]
    fn test_host_matching() {
        let hosts = AllowedHosts::new(&[
            "api.bank.example".to_string(),
            "*.internal.bank.example".to_string(),
            "localhost".to_string(),
        ]);
        assert!(hosts.permits(Some("api.bank.example")));
        assert!(hosts.permits(Some("API.bank.example:443")));
        assert!(hosts.permits(Some("localhost:8080")));
        assert!(hosts.permits(Some("accounts.internal.bank.example")));
        assert!(!hosts.permits(Some("internal.bank.example.evil.com")));
        assert!(!hosts.permits(Some("evil.example")));
        assert!(!hosts.permits(None));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
    }
}
