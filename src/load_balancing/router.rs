//! # Service Router
//!
//! Registry of backend instances keyed by logical service name, plus the
//! selection logic that turns a service name into a concrete base URL.
//!
//! ## Selection
//!
//! 1. Unknown service name: `None`.
//! 2. Candidates are the instances that are not `Unhealthy`.
//! 3. If no candidate remains, the first registered instance is returned anyway
//!    (best effort; the downstream call decides).
//! 4. Otherwise the configured [`LoadBalancingStrategy`] picks one.
//!
//! Every selection bumps the chosen instance's pending counter; callers report
//! back through [`ServiceRouter::record_completion`] with the URL they were
//! given so the counter drops and the latency average moves. Callers that may
//! be cancelled mid-request use [`ServiceRouter::acquire`] instead: the
//! returned [`PendingRequest`] settles the counter when dropped.
//!
//! ## Routing health
//!
//! An instance leaves rotation once it has failed `unhealthy_threshold` probes
//! in a row, and returns on its next passing probe. Fewer failures leave its
//! routing health as it was.
//!
//! The round-robin cursor belongs to the service, not to an instance list, so
//! it survives instances being added or removed.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::instance::{InstanceHealth, InstanceSnapshot, ServiceInstance};
use super::strategies::LoadBalancingStrategy;
use crate::observability::health::{HealthObserver, HealthStatus, InstanceDirectory};

#[derive(Debug, Default)]
struct ServicePool {
    instances: RwLock<Vec<Arc<ServiceInstance>>>,
    cursor: AtomicUsize,
}

/// Per-service view returned by [`ServiceRouter::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub service: String,
    pub instances: Vec<InstanceSnapshot>,
}

/// Consecutive failed probes that take an instance out of rotation unless
/// configured otherwise.
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

#[derive(Debug)]
pub struct ServiceRouter {
    services: DashMap<String, Arc<ServicePool>>,
    strategy: LoadBalancingStrategy,
    unhealthy_threshold: u32,
}

impl ServiceRouter {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            services: DashMap::new(),
            strategy,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
        }
    }

    /// Values below 1 are treated as 1.
    pub fn with_unhealthy_threshold(mut self, threshold: u32) -> Self {
        self.unhealthy_threshold = threshold.max(1);
        self
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    pub fn unhealthy_threshold(&self) -> u32 {
        self.unhealthy_threshold
    }

    fn pool(&self, service: &str) -> Option<Arc<ServicePool>> {
        self.services.get(service).map(|entry| entry.value().clone())
    }

    /// Register an instance. Returns `false` if it was already present.
    pub fn add_instance(&self, service: &str, host: &str, port: u16, protocol: &str) -> bool {
        let pool = self
            .services
            .entry(service.to_string())
            .or_default()
            .value()
            .clone();

        let mut instances = pool.instances.write();
        if instances.iter().any(|i| i.matches(host, port)) {
            return false;
        }

        let instance = ServiceInstance::new(service, host, port, protocol);
        info!(service = %service, instance = %instance.base_url(), "Registered service instance");
        instances.push(Arc::new(instance));
        true
    }

    /// Deregister an instance. Returns `false` when nothing matched.
    pub fn remove_instance(&self, service: &str, host: &str, port: u16) -> bool {
        let Some(pool) = self.pool(service) else {
            return false;
        };

        let mut instances = pool.instances.write();
        let before = instances.len();
        instances.retain(|i| !i.matches(host, port));
        let removed = instances.len() != before;
        if removed {
            info!(service = %service, host = %host, port, "Deregistered service instance");
        }
        removed
    }

    /// Pick an instance for `service` and mark a request pending on it.
    pub fn select_instance(&self, service: &str) -> Option<Arc<ServiceInstance>> {
        let pool = self.pool(service)?;
        let instances = pool.instances.read().clone();
        let first = instances.first()?.clone();

        let candidates: Vec<_> = instances.into_iter().filter(|i| i.is_routable()).collect();

        let chosen = match self.strategy.select(&candidates, &pool.cursor) {
            Some(index) => candidates[index].clone(),
            None => {
                warn!(
                    service = %service,
                    instance = %first.base_url(),
                    "No healthy instance available, falling back to first registered instance"
                );
                first
            }
        };

        chosen.begin_request();
        counter!(
            "load_balancer_selections_total",
            "service" => service.to_string(),
            "strategy" => self.strategy.as_str()
        )
        .increment(1);
        debug!(
            service = %service,
            instance = %chosen.base_url(),
            strategy = self.strategy.as_str(),
            "Selected instance"
        );
        Some(chosen)
    }

    /// Like [`select_instance`](Self::select_instance), but the pending slot is
    /// released when the returned guard is completed or dropped.
    pub fn acquire(&self, service: &str) -> Option<PendingRequest> {
        let instance = self.select_instance(service)?;
        Some(PendingRequest {
            instance,
            started: Instant::now(),
            settled: false,
        })
    }

    /// Base URL of a selected instance, or `None` for an unknown service.
    pub fn get_service_url(&self, service: &str) -> Option<String> {
        self.select_instance(service)
            .map(|instance| instance.base_url().to_string())
    }

    /// Report the outcome of a request previously routed to `url`.
    pub fn record_completion(&self, service: &str, url: &str, response_time: Duration, success: bool) {
        let Some(instance) = self.find(service, url) else {
            debug!(service = %service, instance = %url, "Completion for unknown instance ignored");
            return;
        };
        settle(&instance, response_time, success);
    }

    fn find(&self, service: &str, url: &str) -> Option<Arc<ServiceInstance>> {
        let pool = self.pool(service)?;
        let instances = pool.instances.read();
        instances.iter().find(|i| i.base_url() == url).cloned()
    }

    pub fn instances(&self, service: &str) -> Vec<Arc<ServiceInstance>> {
        self.pool(service)
            .map(|pool| pool.instances.read().clone())
            .unwrap_or_default()
    }

    pub fn contains_service(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        self.service_names()
            .into_iter()
            .map(|service| ServiceSnapshot {
                instances: self.instances(&service).iter().map(|i| i.snapshot()).collect(),
                service,
            })
            .collect()
    }
}

fn settle(instance: &ServiceInstance, response_time: Duration, success: bool) {
    instance.complete_request(response_time);
    if !success {
        debug!(
            service = %instance.service(),
            instance = %instance.base_url(),
            response_ms = response_time.as_millis() as u64,
            "Request completed with failure"
        );
    }
}

/// A request in flight on a selected instance.
///
/// Dropping it without calling [`complete`](Self::complete) counts the request
/// as failed, with the time elapsed since selection.
#[derive(Debug)]
pub struct PendingRequest {
    instance: Arc<ServiceInstance>,
    started: Instant,
    settled: bool,
}

impl PendingRequest {
    pub fn instance(&self) -> &Arc<ServiceInstance> {
        &self.instance
    }

    pub fn base_url(&self) -> &str {
        self.instance.base_url()
    }

    pub fn complete(mut self, response_time: Duration, success: bool) {
        self.settled = true;
        settle(&self.instance, response_time, success);
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        debug!(
            service = %self.instance.service(),
            instance = %self.instance.base_url(),
            "Request abandoned before completion"
        );
        settle(&self.instance, self.started.elapsed(), false);
    }
}

impl InstanceDirectory for ServiceRouter {
    fn instance_urls(&self, service: &str) -> Vec<String> {
        self.instances(service)
            .iter()
            .map(|i| i.base_url().to_string())
            .collect()
    }
}

impl HealthObserver for ServiceRouter {
    fn on_probe(&self, service: &str, instance_url: &str, success: bool, status: HealthStatus) {
        let Some(instance) = self.find(service, instance_url) else {
            return;
        };
        let failures = instance.record_probe(success);

        let health = if failures >= self.unhealthy_threshold {
            InstanceHealth::Unhealthy
        } else if success {
            InstanceHealth::Healthy
        } else {
            instance.health()
        };
        let previous = instance.set_health(health);
        if previous != health {
            match health {
                InstanceHealth::Unhealthy => warn!(
                    service = %service,
                    instance = %instance_url,
                    consecutive_failures = instance.consecutive_failures(),
                    "Instance removed from rotation"
                ),
                _ => info!(
                    service = %service,
                    instance = %instance_url,
                    from = ?previous,
                    to = ?health,
                    probe_status = status.as_str(),
                    "Instance routing health changed"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with(service: &str, ports: &[u16]) -> ServiceRouter {
        let router = ServiceRouter::new(LoadBalancingStrategy::RoundRobin);
        for port in ports {
            router.add_instance(service, "localhost", *port, "http");
        }
        router
    }

    #[test]
    fn test_round_robin_cycles_twice() {
        let router = router_with("accounts", &[8001, 8002, 8003]);
        let picks: Vec<_> = (0..6)
            .map(|_| router.get_service_url("accounts").unwrap())
            .collect();

        assert_eq!(
            picks,
            vec![
                "http://localhost:8001",
                "http://localhost:8002",
                "http://localhost:8003",
                "http://localhost:8001",
                "http://localhost:8002",
                "http://localhost:8003",
            ]
        );
    }

    #[test]
    fn test_unknown_service_is_none() {
        let router = router_with("accounts", &[8001]);
        assert!(router.get_service_url("payments").is_none());
    }

    #[test]
    fn test_add_and_remove_are_idempotent() {
        let router = router_with("accounts", &[8001]);
        assert!(!router.add_instance("accounts", "localhost", 8001, "http"));
        assert_eq!(router.instances("accounts").len(), 1);

        assert!(router.remove_instance("accounts", "localhost", 8001));
        assert!(!router.remove_instance("accounts", "localhost", 8001));
        assert!(!router.remove_instance("ghost", "localhost", 1));
        assert!(router.get_service_url("accounts").is_none());
    }

    fn fail_probes(router: &ServiceRouter, url: &str, times: u32) {
        for _ in 0..times {
            router.on_probe("accounts", url, false, HealthStatus::Unhealthy);
        }
    }

    #[test]
    fn test_unhealthy_instances_are_skipped() {
        let router = router_with("accounts", &[8001, 8002]);
        fail_probes(&router, "http://localhost:8001", DEFAULT_UNHEALTHY_THRESHOLD);

        for _ in 0..4 {
            assert_eq!(
                router.get_service_url("accounts").unwrap(),
                "http://localhost:8002"
            );
        }

        router.on_probe("accounts", "http://localhost:8001", true, HealthStatus::Degraded);
        let picks: Vec<_> = (0..2)
            .map(|_| router.get_service_url("accounts").unwrap())
            .collect();
        assert!(picks.contains(&"http://localhost:8001".to_string()));
    }

    #[test]
    fn test_falls_back_to_first_when_all_unhealthy() {
        let router = router_with("accounts", &[8001, 8002]);
        fail_probes(&router, "http://localhost:8001", DEFAULT_UNHEALTHY_THRESHOLD);
        fail_probes(&router, "http://localhost:8002", DEFAULT_UNHEALTHY_THRESHOLD);
        assert_eq!(
            router.get_service_url("accounts").unwrap(),
            "http://localhost:8001"
        );
    }

    #[test]
    fn test_long_healthy_instance_leaves_rotation_after_threshold_failures() {
        let router = router_with("accounts", &[8001, 8002]);
        let url = "http://localhost:8001";
        for _ in 0..10 {
            router.on_probe("accounts", url, true, HealthStatus::Healthy);
        }

        // Two misses after a clean run: still routable although the probe
        // status is already degraded.
        router.on_probe("accounts", url, false, HealthStatus::Degraded);
        router.on_probe("accounts", url, false, HealthStatus::Degraded);
        let instance = router.instances("accounts")[0].clone();
        assert_eq!(instance.health(), InstanceHealth::Healthy);
        assert!(instance.is_routable());

        router.on_probe("accounts", url, false, HealthStatus::Degraded);
        assert_eq!(instance.health(), InstanceHealth::Unhealthy);
        assert_eq!(instance.consecutive_failures(), 3);
        for _ in 0..4 {
            assert_eq!(
                router.get_service_url("accounts").unwrap(),
                "http://localhost:8002"
            );
        }

        router.on_probe("accounts", url, true, HealthStatus::Degraded);
        assert_eq!(instance.health(), InstanceHealth::Healthy);
    }

    #[test]
    fn test_single_failure_does_not_remove_fresh_instance() {
        let router = router_with("accounts", &[8001]);
        router.on_probe("accounts", "http://localhost:8001", false, HealthStatus::Unhealthy);
        let instance = router.instances("accounts")[0].clone();
        assert_eq!(instance.health(), InstanceHealth::Unknown);
        assert!(instance.is_routable());
    }

    #[test]
    fn test_threshold_is_configurable() {
        let router = ServiceRouter::new(LoadBalancingStrategy::RoundRobin).with_unhealthy_threshold(1);
        router.add_instance("accounts", "localhost", 8001, "http");
        router.on_probe("accounts", "http://localhost:8001", false, HealthStatus::Unhealthy);
        assert_eq!(router.instances("accounts")[0].health(), InstanceHealth::Unhealthy);

        let clamped = ServiceRouter::new(LoadBalancingStrategy::RoundRobin).with_unhealthy_threshold(0);
        assert_eq!(clamped.unhealthy_threshold(), 1);
    }

    #[test]
    fn test_dropped_pending_request_releases_slot() {
        let router = router_with("accounts", &[8001]);
        let pending = router.acquire("accounts").unwrap();
        assert_eq!(pending.base_url(), "http://localhost:8001");
        assert_eq!(router.instances("accounts")[0].pending(), 1);

        drop(pending);
        let instance = &router.instances("accounts")[0];
        assert_eq!(instance.pending(), 0);
        assert_eq!(instance.snapshot().completed_requests, 1);
    }

    #[test]
    fn test_completed_pending_request_settles_once() {
        let router = router_with("accounts", &[8001]);
        router.acquire("accounts").unwrap().complete(Duration::from_millis(40), true);

        let instance = &router.instances("accounts")[0];
        assert_eq!(instance.pending(), 0);
        assert_eq!(instance.avg_response_time_ms(), Some(40.0));
        assert_eq!(instance.snapshot().completed_requests, 1);
        assert!(router.acquire("ghost").is_none());
    }

    #[test]
    fn test_record_completion_updates_instance() {
        let router = router_with("accounts", &[8001]);
        let url = router.get_service_url("accounts").unwrap();
        assert_eq!(router.instances("accounts")[0].pending(), 1);

        router.record_completion("accounts", &url, Duration::from_millis(50), true);
        let instance = &router.instances("accounts")[0];
        assert_eq!(instance.pending(), 0);
        assert_eq!(instance.avg_response_time_ms(), Some(50.0));

        router.record_completion("accounts", &url, Duration::from_millis(50), false);
        assert_eq!(router.instances("accounts")[0].pending(), 0);
    }

    #[test]
    fn test_cursor_survives_membership_changes() {
        let router = router_with("accounts", &[8001, 8002]);
        router.get_service_url("accounts");
        router.add_instance("accounts", "localhost", 8003, "http");
        assert_eq!(
            router.get_service_url("accounts").unwrap(),
            "http://localhost:8002"
        );
    }

    #[test]
    fn test_snapshot_lists_services_sorted() {
        let router = router_with("payments", &[8004]);
        router.add_instance("accounts", "localhost", 8002, "http");
        let snapshot = router.snapshot();
        assert_eq!(snapshot[0].service, "accounts");
        assert_eq!(snapshot[1].instances[0].url, "http://localhost:8004");
    }
}
