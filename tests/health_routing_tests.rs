//! Health checking feeding instance selection, end to end.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use banking_gateway::load_balancing::InstanceHealth;
use banking_gateway::observability::health::{
    HealthCheckConfig, HealthChecker, HealthProbe, HealthStatus, InstanceDirectory, ProbeOutcome,
};
use banking_gateway::{LoadBalancingStrategy, ServiceRouter};

const GOOD: &str = "http://accounts-a:8002";
const FLAKY: &str = "http://accounts-b:8002";

/// Fails probes against `accounts-b` while `failing` is set.
#[derive(Default)]
struct SwitchableProbe {
    failing: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl HealthProbe for SwitchableProbe {
    async fn probe(&self, url: &str, _timeout: Duration) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if url.contains("accounts-b") && self.failing.load(Ordering::SeqCst) {
            ProbeOutcome::failure(Duration::from_millis(3), "connection refused")
        } else {
            ProbeOutcome::success(Duration::from_millis(3))
        }
    }
}

fn setup(probe: Arc<SwitchableProbe>) -> (Arc<ServiceRouter>, Arc<HealthChecker>) {
    let router = Arc::new(ServiceRouter::new(LoadBalancingStrategy::RoundRobin).with_unhealthy_threshold(3));
    router.add_instance("accounts", "accounts-a", 8002, "http");
    router.add_instance("accounts", "accounts-b", 8002, "http");

    let directory: Arc<dyn InstanceDirectory> = router.clone();
    let checker = Arc::new(HealthChecker::with_probe(
        HealthCheckConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            failure_backoff: Duration::from_secs(5),
            unhealthy_threshold: 3,
        },
        directory,
        probe,
    ));
    checker.add_observer(router.clone());
    checker.register_service("accounts", "/health");
    (router, checker)
}

fn urls_over(router: &ServiceRouter, calls: usize) -> HashSet<String> {
    (0..calls)
        .filter_map(|_| {
            let instance = router.select_instance("accounts")?;
            router.record_completion("accounts", instance.base_url(), Duration::from_millis(1), true);
            Some(instance.base_url().to_string())
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_failing_instance_leaves_rotation_after_three_probes() {
    let probe = Arc::new(SwitchableProbe::default());
    probe.failing.store(true, Ordering::SeqCst);
    let (router, checker) = setup(probe.clone());

    assert_eq!(urls_over(&router, 4).len(), 2);

    checker.start();
    // Scheduled polls at t=0, 10 and 20.
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(probe.calls.load(Ordering::SeqCst), 6);

    assert_eq!(checker.instance_status("accounts", FLAKY), HealthStatus::Unhealthy);
    assert_eq!(checker.instance_status("accounts", GOOD), HealthStatus::Healthy);

    let flaky = router
        .instances("accounts")
        .into_iter()
        .find(|i| i.base_url() == FLAKY)
        .unwrap();
    assert_eq!(flaky.health(), InstanceHealth::Unhealthy);
    assert_eq!(flaky.consecutive_failures(), 3);

    for _ in 0..10 {
        assert_eq!(router.get_service_url("accounts").as_deref(), Some(GOOD));
    }

    checker.stop().await;
}

#[tokio::test]
async fn test_instance_returns_after_passing_probe() {
    let probe = Arc::new(SwitchableProbe::default());
    probe.failing.store(true, Ordering::SeqCst);
    let (router, checker) = setup(probe.clone());

    for _ in 0..3 {
        checker.check_service("accounts").await.unwrap();
    }
    assert_eq!(urls_over(&router, 6), HashSet::from([GOOD.to_string()]));

    probe.failing.store(false, Ordering::SeqCst);
    checker.check_service("accounts").await.unwrap();

    // One success in four keeps the instance degraded, which is routable.
    assert_eq!(checker.instance_status("accounts", FLAKY), HealthStatus::Degraded);
    assert_eq!(
        urls_over(&router, 6),
        HashSet::from([GOOD.to_string(), FLAKY.to_string()])
    );
}

#[tokio::test]
async fn test_long_healthy_instance_leaves_rotation_after_three_failures() {
    let probe = Arc::new(SwitchableProbe::default());
    let (router, checker) = setup(probe.clone());
    for _ in 0..10 {
        checker.check_service("accounts").await.unwrap();
    }

    probe.failing.store(true, Ordering::SeqCst);
    for _ in 0..2 {
        checker.check_service("accounts").await.unwrap();
    }
    assert_eq!(
        urls_over(&router, 6),
        HashSet::from([GOOD.to_string(), FLAKY.to_string()])
    );

    checker.check_service("accounts").await.unwrap();
    // Seven of the last ten checks passed, so the checker only calls it degraded.
    assert_eq!(checker.instance_status("accounts", FLAKY), HealthStatus::Degraded);
    assert_eq!(urls_over(&router, 6), HashSet::from([GOOD.to_string()]));
}

#[tokio::test]
async fn test_all_instances_down_falls_back_to_first() {
    let probe = Arc::new(SwitchableProbe::default());
    probe.failing.store(true, Ordering::SeqCst);
    let (router, checker) = setup(probe);
    router.remove_instance("accounts", "accounts-a", 8002);

    checker.check_service("accounts").await.unwrap();
    assert_eq!(checker.service_status("accounts"), HealthStatus::Unhealthy);

    // Best effort: the only known instance is still returned.
    assert_eq!(router.get_service_url("accounts").as_deref(), Some(FLAKY));
    assert_eq!(router.get_service_url("cards"), None);
}

#[tokio::test]
async fn test_check_all_now_reports_every_service() {
    let probe = Arc::new(SwitchableProbe::default());
    let (router, checker) = setup(probe);
    router.add_instance("loans", "loans-a", 8006, "http");
    checker.register_service("loans", "/status");

    let reports = checker.check_all_now().await;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports["accounts"].metrics.status, HealthStatus::Healthy);
    assert_eq!(reports["accounts"].instances.len(), 2);
    assert_eq!(reports["loans"].metrics.total_checks, 1);
}
