//! # Audit Trail
//!
//! Every state-changing request and every admin request is written to the
//! `audit` tracing target, independent of the regular request log, so that
//! the subscriber can route it to a separate sink.

use std::time::Instant;

use axum::extract::Request;
use axum::http::Method;
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

use crate::core::types::{client_ip, AuthContext};
use crate::observability::logging::AUDIT_TARGET;

fn is_audited(method: &Method, path: &str) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    ) || path.starts_with("/admin")
        || path.starts_with("/api/v1/audit")
}

pub async fn audit_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if !is_audited(&method, &path) {
        return next.run(request).await;
    }

    let user_id = request
        .extensions()
        .get::<AuthContext>()
        .map(|ctx| ctx.user_id.clone())
        .unwrap_or_else(|| "anonymous".to_string());
    let client = client_ip(&request);
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        target: AUDIT_TARGET,
        user_id = %user_id,
        client_ip = %client,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "Audited request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutations_and_admin_are_audited() {
        assert!(is_audited(&Method::POST, "/api/v1/payments"));
        assert!(is_audited(&Method::DELETE, "/api/v1/accounts/1"));
        assert!(is_audited(&Method::GET, "/admin/circuit-breakers"));
        assert!(is_audited(&Method::GET, "/api/v1/audit/events"));
        assert!(!is_audited(&Method::GET, "/api/v1/accounts/1"));
        assert!(!is_audited(&Method::HEAD, "/health"));
    }
}
