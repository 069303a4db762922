//! # Request Forwarder
//!
//! Turns an inbound request plus a resolved instance base URL into a
//! downstream call, then maps the downstream answer (or failure) back into
//! an axum [`Response`].
//!
//! Outbound request:
//! - URL is `base + downstream path + original query`
//! - inbound headers are copied except `Host` and hop-by-hop headers
//! - `X-User-ID`, `X-User-Roles`, `X-Trace-ID` and `X-Gateway-Version` are set
//! - the body is forwarded unchanged for `POST`, `PUT`, `PATCH` and `DELETE`
//!
//! Outcome:
//! - downstream status is relayed as-is; JSON bodies are re-serialized,
//!   anything else passes through as opaque bytes
//! - timeout maps to 504, any other transport failure to 502
//!
//! `axum` and `reqwest` sit on different `http` crate versions, so headers,
//! methods and status codes cross the boundary as raw bytes.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{headers, AuthContext};
use crate::routing::Route;

/// Largest inbound body the gateway will buffer.
pub const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;

const MAX_REDIRECTS: usize = 10;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn skip_request_header(name: &str) -> bool {
    name == "host" || name == "content-length" || HOP_BY_HOP.contains(&name)
}

fn skip_response_header(name: &str) -> bool {
    name == "content-length" || HOP_BY_HOP.contains(&name)
}

fn carries_body(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Outcome of one forwarded call, for load balancer bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub elapsed: Duration,
    /// False on transport failure or a 5xx status
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    timeout: Duration,
    gateway_version: String,
}

impl Forwarder {
    pub fn new(timeout: Duration, gateway_version: impl Into<String>) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self {
            client,
            timeout,
            gateway_version: gateway_version.into(),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Full downstream URL for `request` against `base_url`.
    pub fn outbound_url(base_url: &str, route: &Route, path: &str, query: Option<&str>) -> String {
        let mut url = format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            route.downstream_path(path)
        );
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    /// Forward `request` to `base_url`. The returned outcome is what the
    /// caller reports to the load balancer; the result is what the client sees.
    pub async fn forward(
        &self,
        service: &str,
        base_url: &str,
        route: &Route,
        request: Request,
    ) -> (GatewayResult<Response>, ForwardOutcome) {
        let start = Instant::now();
        let result = self.execute(service, base_url, route, request).await;
        let outcome = ForwardOutcome {
            elapsed: start.elapsed(),
            success: matches!(&result, Ok(response) if !response.status().is_server_error()),
        };
        (result, outcome)
    }

    async fn execute(
        &self,
        service: &str,
        base_url: &str,
        route: &Route,
        request: Request,
    ) -> GatewayResult<Response> {
        let start = Instant::now();
        let trace_id = Uuid::new_v4().to_string();
        let (parts, body) = request.into_parts();
        let url = Self::outbound_url(base_url, route, parts.uri.path(), parts.uri.query());

        let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
            .map_err(|e| GatewayError::internal(format!("unsupported method: {}", e)))?;

        let mut outbound = reqwest::header::HeaderMap::with_capacity(parts.headers.len() + 4);
        for (name, value) in parts.headers.iter() {
            if skip_request_header(name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                outbound.append(name, value);
            }
        }

        let identity = parts.extensions.get::<AuthContext>();
        let injected = [
            (headers::USER_ID, identity.map(|c| c.user_id.clone())),
            (headers::USER_ROLES, identity.map(|c| c.roles.join(","))),
            (headers::TRACE_ID, Some(trace_id.clone())),
            (headers::GATEWAY_VERSION, Some(self.gateway_version.clone())),
        ];
        for (name, value) in injected {
            let Some(value) = value else { continue };
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&value) {
                outbound.insert(name, value);
            }
        }

        let mut builder = self.client.request(method, &url).headers(outbound);
        if carries_body(&parts.method) {
            let bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY)
                .await
                .map_err(|e| GatewayError::internal(format!("failed to read request body: {}", e)))?;
            builder = builder.body(bytes);
        }

        debug!(service = %service, url = %url, trace_id = %trace_id, "Forwarding request");

        let downstream = builder.send().await.map_err(|e| self.map_error(service, e))?;
        let status = StatusCode::from_u16(downstream.status().as_u16())
            .map_err(|e| GatewayError::BadGateway {
                service: service.to_string(),
                reason: format!("invalid status: {}", e),
            })?;

        let mut response_headers = HeaderMap::with_capacity(downstream.headers().len() + 4);
        for (name, value) in downstream.headers().iter() {
            if skip_response_header(name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.append(name, value);
            }
        }

        let is_json = downstream
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        let bytes = downstream.bytes().await.map_err(|e| self.map_error(service, e))?;
        let body = if is_json { normalize_json(bytes) } else { bytes };

        let elapsed = start.elapsed();
        let annotations = [
            (headers::TARGET_SERVICE, service.to_string()),
            (headers::RESPONSE_TIME, format!("{}ms", elapsed.as_millis())),
            (headers::TRACE_ID, trace_id),
            (headers::GATEWAY_VERSION, self.gateway_version.clone()),
        ];
        for (name, value) in annotations {
            if let Ok(value) = HeaderValue::from_str(&value) {
                response_headers.insert(name, value);
            }
        }

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }

    fn map_error(&self, service: &str, error: reqwest::Error) -> GatewayError {
        if error.is_timeout() {
            warn!(service = %service, timeout = ?self.timeout, "Downstream call timed out");
            GatewayError::Timeout {
                service: service.to_string(),
                timeout: self.timeout,
            }
        } else {
            warn!(service = %service, error = %error, "Downstream call failed");
            GatewayError::BadGateway {
                service: service.to_string(),
                reason: error.to_string(),
            }
        }
    }
}

/// Re-serialize a JSON body; bodies that do not parse pass through untouched.
fn normalize_json(bytes: Bytes) -> Bytes {
    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(value) => serde_json::to_vec(&value).map(Bytes::from).unwrap_or(bytes),
        Err(_) => bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_url() {
        let route = Route::new("/api/v1/accounts", "accounts");
        assert_eq!(
            Forwarder::outbound_url("http://a:8002", &route, "/api/v1/accounts/7", Some("x=1")),
            "http://a:8002/api/v1/accounts/7?x=1"
        );
        assert_eq!(
            Forwarder::outbound_url("http://a:8002/", &route, "/api/v1/accounts", Some("")),
            "http://a:8002/api/v1/accounts"
        );

        let mut stripped = route.clone();
        stripped.strip_prefix = true;
        assert_eq!(
            Forwarder::outbound_url("http://a:8002", &stripped, "/api/v1/accounts/7", None),
            "http://a:8002/7"
        );
    }

    #[test]
    fn test_header_filters() {
        assert!(skip_request_header("host"));
        assert!(skip_request_header("transfer-encoding"));
        assert!(!skip_request_header("authorization"));
        assert!(!skip_response_header("content-type"));
        assert!(skip_response_header("connection"));
    }

    #[test]
    fn test_body_methods() {
        assert!(carries_body(&Method::POST));
        assert!(carries_body(&Method::DELETE));
        assert!(!carries_body(&Method::GET));
        assert!(!carries_body(&Method::HEAD));
    }

    #[test]
    fn test_normalize_json() {
        let pretty = Bytes::from_static(b"{\n  \"balance\": 10\n}");
        assert_eq!(&normalize_json(pretty)[..], br#"{"balance":10}"#);

        let broken = Bytes::from_static(b"{not json");
        assert_eq!(&normalize_json(broken)[..], b"{not json");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_bad_gateway() {
        let forwarder = Forwarder::new(Duration::from_secs(2), "test").unwrap();
        let route = Route::new("/api/v1/loans", "loans");
        let request = Request::builder()
            .uri("/api/v1/loans/1")
            .body(Body::empty())
            .unwrap();

        let (result, outcome) = forwarder
            .forward("loans", "http://127.0.0.1:1", &route, request)
            .await;
        assert!(matches!(result, Err(GatewayError::BadGateway { .. })));
        assert!(!outcome.success);
    }
}
