//! Per-request counters and latency histograms, labelled by the backend
//! service the request was routed to (`gateway` for the gateway's own
//! endpoints).

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use metrics::{counter, gauge, histogram};

use crate::routing::RouteTable;

pub const GATEWAY_LABEL: &str = "gateway";

pub async fn request_metrics_middleware(
    State(routes): State<Arc<RouteTable>>,
    request: Request,
    next: Next,
) -> Response {
    let service = routes
        .resolve(request.uri().path())
        .map(|route| route.service.clone())
        .unwrap_or_else(|| GATEWAY_LABEL.to_string());
    let method = request.method().to_string();
    let start = Instant::now();

    gauge!("gateway_requests_in_flight").increment(1.0);
    let response = next.run(request).await;
    gauge!("gateway_requests_in_flight").decrement(1.0);

    let status = response.status().as_u16().to_string();
    counter!(
        "gateway_requests_total",
        "service" => service.clone(),
        "method" => method,
        "status" => status
    )
    .increment(1);
    histogram!("gateway_request_duration_seconds", "service" => service)
        .record(start.elapsed().as_secs_f64());

    response
}
