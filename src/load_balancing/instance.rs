//! Backend replica bookkeeping used by the [`ServiceRouter`](super::ServiceRouter).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Weight of a new latency sample in the smoothed response time.
pub const EMA_WEIGHT: f64 = 0.2;

/// Fold a sample into an exponential moving average. The first sample seeds it.
pub fn ema(previous: Option<f64>, sample: f64) -> f64 {
    match previous {
        Some(prev) => EMA_WEIGHT * sample + (1.0 - EMA_WEIGHT) * prev,
        None => sample,
    }
}

/// Routing view of an instance's health.
///
/// Only the health checker changes it. `Unknown` instances have not passed a
/// probe yet and are still routable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

/// One replica of a logical backend service.
#[derive(Debug)]
pub struct ServiceInstance {
    service: String,
    host: String,
    port: u16,
    protocol: String,
    base_url: String,
    health: RwLock<InstanceHealth>,
    consecutive_failures: AtomicU32,
    pending: AtomicU64,
    response_time_ms: RwLock<Option<f64>>,
    completed_requests: AtomicU64,
}

/// Serializable view for dashboards and the detailed health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub health: InstanceHealth,
    pub consecutive_failures: u32,
    pub pending_requests: u64,
    pub avg_response_time_ms: Option<f64>,
    pub completed_requests: u64,
    pub load_score: f64,
}

impl ServiceInstance {
    pub fn new(
        service: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        protocol: impl Into<String>,
    ) -> Self {
        let host = host.into();
        let protocol = protocol.into();
        Self {
            base_url: format!("{}://{}:{}", protocol, host, port),
            service: service.into(),
            host,
            port,
            protocol,
            health: RwLock::new(InstanceHealth::Unknown),
            consecutive_failures: AtomicU32::new(0),
            pending: AtomicU64::new(0),
            response_time_ms: RwLock::new(None),
            completed_requests: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// `protocol://host:port`, the key callers use to report completions.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }

    pub fn health(&self) -> InstanceHealth {
        *self.health.read()
    }

    /// Returns the previous value.
    pub(crate) fn set_health(&self, health: InstanceHealth) -> InstanceHealth {
        std::mem::replace(&mut *self.health.write(), health)
    }

    pub fn is_routable(&self) -> bool {
        self.health() != InstanceHealth::Unhealthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Returns the consecutive failure count after this probe.
    pub(crate) fn record_probe(&self, success: bool) -> u32 {
        if success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            0
        } else {
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub(crate) fn begin_request(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn complete_request(&self, response_time: Duration) {
        let _ = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));

        let sample = response_time.as_secs_f64() * 1000.0;
        let mut smoothed = self.response_time_ms.write();
        *smoothed = Some(ema(*smoothed, sample));
        self.completed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_response_time_ms(&self) -> Option<f64> {
        *self.response_time_ms.read()
    }

    /// Comparison-only load figure; grows with both pending requests and
    /// smoothed latency.
    pub fn load_score(&self) -> f64 {
        let pending = self.pending() as f64;
        let latency = self.avg_response_time_ms().unwrap_or(0.0);
        (pending + 1.0) * (latency + 1.0)
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            url: self.base_url.clone(),
            host: self.host.clone(),
            port: self.port,
            protocol: self.protocol.clone(),
            health: self.health(),
            consecutive_failures: self.consecutive_failures(),
            pending_requests: self.pending(),
            avg_response_time_ms: self.avg_response_time_ms(),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            load_score: self.load_score(),
        }
    }
}
