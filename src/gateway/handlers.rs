//! HTTP handlers for the gateway's own endpoints and the proxy fallback.

use std::collections::BTreeMap;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::server::GatewayState;
use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::health::HealthStatus;
use crate::observability::prometheus_handle;

/// Basic liveness with version.
pub async fn health_check(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": state.version(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn liveness_check() -> impl IntoResponse {
    Json(json!({
        "status": "alive",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// Aggregated per-service health plus the router's view of each instance.
pub async fn detailed_health_check(State(state): State<GatewayState>) -> impl IntoResponse {
    let reports: BTreeMap<_, _> = state.health.reports().into_iter().collect();
    let routing: BTreeMap<_, _> = state
        .router
        .snapshot()
        .into_iter()
        .map(|s| (s.service, s.instances))
        .collect();

    let services: BTreeMap<_, _> = reports
        .into_iter()
        .map(|(name, report)| {
            let instances = routing.get(&name).cloned().unwrap_or_default();
            (name, json!({ "health": report, "routing": instances }))
        })
        .collect();

    let overall = if services.is_empty() {
        HealthStatus::Unknown
    } else {
        state.overall_status()
    };

    Json(json!({
        "status": overall,
        "version": state.version(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "services": services,
    }))
}

/// Ready unless a critical service is unhealthy.
pub async fn readiness_check(State(state): State<GatewayState>) -> impl IntoResponse {
    let critical: BTreeMap<String, HealthStatus> = state
        .config
        .critical_services()
        .into_iter()
        .map(|service| {
            let status = state.health.service_status(&service);
            (service, status)
        })
        .collect();

    let blocked: Vec<&String> = critical
        .iter()
        .filter(|(_, status)| **status == HealthStatus::Unhealthy)
        .map(|(name, _)| name)
        .collect();

    let (code, status) = if blocked.is_empty() {
        (StatusCode::OK, "ready")
    } else {
        warn!(services = ?blocked, "Readiness failing on critical services");
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };

    (
        code,
        Json(json!({
            "status": status,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "critical_services": critical,
        })),
    )
}

pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        prometheus_handle().render(),
    )
}

#[derive(Debug, Deserialize)]
pub struct RegisterInstance {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

pub async fn list_services(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.router.snapshot())
}

pub async fn register_instance(
    State(state): State<GatewayState>,
    Path(service): Path<String>,
    Json(body): Json<RegisterInstance>,
) -> GatewayResult<Response> {
    if body.host.is_empty() || body.port == 0 {
        return Err(GatewayError::invalid("instance host and port are required"));
    }

    let added = state
        .router
        .add_instance(&service, &body.host, body.port, &body.protocol);
    if !state.health.services().contains(&service) {
        let path = state
            .config
            .services
            .get(&service)
            .map(|s| s.health_check_path.clone())
            .unwrap_or_else(|| "/health".to_string());
        state.health.register_service(&service, &path);
    }

    info!(service = %service, host = %body.host, port = body.port, added, "Instance registration");
    let code = if added { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        code,
        Json(json!({
            "service": service,
            "host": body.host,
            "port": body.port,
            "added": added,
        })),
    )
        .into_response())
}

pub async fn deregister_instance(
    State(state): State<GatewayState>,
    Path((service, host, port)): Path<(String, String, u16)>,
) -> impl IntoResponse {
    let url = state
        .router
        .instances(&service)
        .iter()
        .find(|i| i.matches(&host, port))
        .map(|i| i.base_url().to_string());
    let removed = state.router.remove_instance(&service, &host, port);
    if let (true, Some(url)) = (removed, url) {
        state.health.forget_instance(&service, &url);
    }
    info!(service = %service, host = %host, port, removed, "Instance deregistration");
    Json(json!({
        "service": service,
        "host": host,
        "port": port,
        "removed": removed,
    }))
}

pub async fn circuit_breakers(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.breakers.snapshots())
}

/// Probe every service immediately and return the fresh reports.
pub async fn check_health_now(State(state): State<GatewayState>) -> impl IntoResponse {
    let reports: BTreeMap<_, _> = state.health.check_all_now().await.into_iter().collect();
    Json(reports)
}

/// Catch-all: resolve the route, pick an instance and forward.
pub async fn proxy_handler(State(state): State<GatewayState>, request: Request) -> Response {
    match proxy(&state, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn proxy(state: &GatewayState, request: Request) -> GatewayResult<Response> {
    let path = request.uri().path().to_string();
    let route = state
        .routes
        .resolve(&path)
        .cloned()
        .ok_or(GatewayError::RouteNotFound { path })?;

    // Settles the instance's pending count even if this future is dropped.
    let pending = state.router.acquire(&route.service).ok_or_else(|| {
        GatewayError::service_unavailable(&route.service, "no instance registered")
    })?;

    let (result, outcome) = state
        .forwarder
        .forward(&route.service, pending.base_url(), &route, request)
        .await;
    pending.complete(outcome.elapsed, outcome.success);
    result
}
