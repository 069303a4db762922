use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, warn};

use crate::core::types::headers;

/// One structured line per request. Server errors are logged at `warn`.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start_time = Instant::now();

    let response = next.run(request).await;

    let duration = start_time.elapsed();
    let status = response.status();
    let target_service = response
        .headers()
        .get(headers::TARGET_SERVICE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    let trace_id = response
        .headers()
        .get(headers::TRACE_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");

    if status.is_server_error() {
        warn!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            service = target_service,
            trace_id = trace_id,
            duration_ms = duration.as_millis() as u64,
            "Request failed"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            service = target_service,
            trace_id = trace_id,
            duration_ms = duration.as_millis() as u64,
            "Request processed"
        );
    }
    response
}
