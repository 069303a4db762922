//! # Metrics Exposition
//!
//! Components record through the `metrics` facade (`counter!`, `histogram!`,
//! `gauge!`). This module installs a Prometheus recorder once per process and
//! hands out its [`PrometheusHandle`] so `GET /metrics` can render the text
//! exposition format.
//!
//! Metric names recorded across the crate:
//!
//! - `gateway_requests_total{service,status}`
//! - `gateway_request_duration_seconds{service}`
//! - `gateway_rate_limited_total`, `gateway_rate_limit_store_fallback_total`
//! - `gateway_cache_hits_total`, `gateway_cache_misses_total`
//! - `circuit_breaker_transitions_total{service,to}`, `circuit_breaker_rejections_total{service}`
//! - `health_check_total{service,result}`
//! - `load_balancer_selections_total{service,strategy}`

use std::sync::OnceLock;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::warn;

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Install the Prometheus recorder if it is not installed yet and return its
/// handle. If another recorder already owns the global slot the handle still
/// renders, just without the crate's samples.
pub fn prometheus_handle() -> PrometheusHandle {
    PROMETHEUS
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let builder = match builder.set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                LATENCY_BUCKETS,
            ) {
                Ok(builder) => builder,
                Err(e) => {
                    warn!(error = %e, "Invalid histogram buckets, using summaries");
                    PrometheusBuilder::new()
                }
            };

            let recorder = builder.build_recorder();
            let handle = recorder.handle();
            if metrics::set_global_recorder(recorder).is_err() {
                warn!("A global metrics recorder is already installed");
            }
            handle
        })
        .clone()
}
