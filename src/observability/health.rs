//! # Health Checking
//!
//! The [`HealthChecker`] polls every registered backend service on a fixed
//! interval and keeps rolling [`HealthMetrics`] for each service and for each
//! of its instances.
//!
//! ## Polling model
//!
//! - One long-lived tokio task per service, fully independent of request
//!   handling. Each poll probes every instance of the service concurrently.
//! - A probe is a `GET {instance}{health_path}` under a bounded timeout. Only
//!   an HTTP 200 counts as success.
//! - A poll that cannot run at all (no instances, unknown service) sleeps a
//!   short fixed backoff instead of the full interval.
//! - [`HealthChecker::stop`] cancels the tasks and awaits them, so a poll that
//!   is mid-flight finishes before `stop` returns.
//!
//! ## Status derivation
//!
//! Status is a pure function of the rolling success rate (last 10 checks) and
//! the smoothed response time:
//!
//! | Condition                                  | Status      |
//! |--------------------------------------------|-------------|
//! | no checks recorded                         | `Unknown`   |
//! | success rate == 0%                         | `Unhealthy` |
//! | success rate < 80% or latency > 5s         | `Degraded`  |
//! | otherwise                                  | `Healthy`   |
//!
//! ## Out-of-band checks
//!
//! [`HealthChecker::check_all_now`] probes everything immediately and records
//! the results in the same metrics and history as scheduled polls, so the
//! dashboard and the router always agree.
//!
//! The checker does not know about the load balancer. It reads instance URLs
//! through an [`InstanceDirectory`] and reports every probe to registered
//! [`HealthObserver`]s. Routing decisions use consecutive failures against
//! [`HealthCheckConfig::unhealthy_threshold`], not the status above.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::instance::ema;

/// Checks kept per metrics entry.
pub const HISTORY_CAPACITY: usize = 100;
/// Checks the success rate is computed over.
pub const ROLLING_WINDOW: usize = 10;
/// Below this rolling success rate a service is degraded.
pub const DEGRADED_SUCCESS_RATE: f64 = 0.8;
/// Above this smoothed latency a service is degraded.
pub const DEGRADED_RESPONSE_TIME: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

/// Derive a status from the rolling success rate (0.0..=1.0) and the smoothed
/// response time.
pub fn derive_status(success_rate: Option<f64>, avg_response_time: Option<Duration>) -> HealthStatus {
    let Some(rate) = success_rate else {
        return HealthStatus::Unknown;
    };

    if rate <= 0.0 {
        HealthStatus::Unhealthy
    } else if rate < DEGRADED_SUCCESS_RATE
        || avg_response_time.is_some_and(|t| t > DEGRADED_RESPONSE_TIME)
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Per-probe deadline
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Sleep after a poll that could not run
    #[serde(with = "humantime_serde")]
    pub failure_backoff: Duration,

    /// Consecutive failed probes before an instance leaves rotation
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            failure_backoff: Duration::from_secs(5),
            unhealthy_threshold: 3,
        }
    }
}

/// Result of a single probe.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub success: bool,
    pub response_time: Duration,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn success(response_time: Duration) -> Self {
        Self {
            success: true,
            response_time,
            error: None,
        }
    }

    pub fn failure(response_time: Duration, error: impl Into<String>) -> Self {
        Self {
            success: false,
            response_time,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckRecord {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub response_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Rolling health figures for one service or one instance.
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    avg_response_time_ms: Option<f64>,
    history: VecDeque<HealthCheckRecord>,
    error_count: u64,
    last_error: Option<String>,
    last_check: Option<DateTime<Utc>>,
    status: HealthStatus,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            avg_response_time_ms: None,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            error_count: 0,
            last_error: None,
            last_check: None,
            status: HealthStatus::Unknown,
        }
    }
}

impl HealthMetrics {
    /// Fold in a probe outcome and return the status before and after.
    pub fn record(&mut self, outcome: &ProbeOutcome) -> (HealthStatus, HealthStatus) {
        let now = Utc::now();
        let response_time_ms = outcome.response_time.as_secs_f64() * 1000.0;

        if outcome.success {
            self.avg_response_time_ms = Some(ema(self.avg_response_time_ms, response_time_ms));
        } else {
            self.error_count += 1;
            self.last_error = outcome.error.clone();
        }

        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(HealthCheckRecord {
            timestamp: now,
            success: outcome.success,
            response_time_ms,
            error: outcome.error.clone(),
        });
        self.last_check = Some(now);

        let previous = self.status;
        self.status = derive_status(self.success_rate(), self.avg_response_time());
        (previous, self.status)
    }

    /// Success ratio over the most recent [`ROLLING_WINDOW`] checks.
    pub fn success_rate(&self) -> Option<f64> {
        let recent: Vec<_> = self.history.iter().rev().take(ROLLING_WINDOW).collect();
        if recent.is_empty() {
            return None;
        }
        let successes = recent.iter().filter(|r| r.success).count();
        Some(successes as f64 / recent.len() as f64)
    }

    pub fn avg_response_time(&self) -> Option<Duration> {
        self.avg_response_time_ms
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn history(&self) -> &VecDeque<HealthCheckRecord> {
        &self.history
    }

    fn report(&self) -> MetricsReport {
        MetricsReport {
            status: self.status,
            success_rate: self.success_rate(),
            avg_response_time_ms: self.avg_response_time_ms,
            error_count: self.error_count,
            last_error: self.last_error.clone(),
            last_check: self.last_check,
            total_checks: self.history.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub status: HealthStatus,
    pub success_rate: Option<f64>,
    pub avg_response_time_ms: Option<f64>,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
    pub total_checks: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealthReport {
    pub url: String,
    #[serde(flatten)]
    pub metrics: MetricsReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealthReport {
    pub service: String,
    #[serde(flatten)]
    pub metrics: MetricsReport,
    pub instances: Vec<InstanceHealthReport>,
}

/// Issues one health probe.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome;
}

/// Probe over HTTP with `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.client.get(url).send()).await;
        let elapsed = started.elapsed();

        match result {
            Ok(Ok(response)) if response.status() == reqwest::StatusCode::OK => {
                ProbeOutcome::success(elapsed)
            }
            Ok(Ok(response)) => ProbeOutcome::failure(
                elapsed,
                format!("unexpected status code: {}", response.status().as_u16()),
            ),
            Ok(Err(e)) => ProbeOutcome::failure(elapsed, e.to_string()),
            Err(_) => ProbeOutcome::failure(elapsed, format!("timed out after {:?}", timeout)),
        }
    }
}

/// Where the checker finds the instances of a service.
pub trait InstanceDirectory: Send + Sync {
    fn instance_urls(&self, service: &str) -> Vec<String>;
}

/// Receives every probe result together with the instance's new status.
pub trait HealthObserver: Send + Sync {
    fn on_probe(&self, service: &str, instance_url: &str, success: bool, status: HealthStatus);
}

struct Running {
    token: CancellationToken,
    handles: HashMap<String, JoinHandle<()>>,
}

pub struct HealthChecker {
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    directory: Arc<dyn InstanceDirectory>,
    observers: RwLock<Vec<Arc<dyn HealthObserver>>>,
    health_paths: DashMap<String, String>,
    service_metrics: DashMap<String, HealthMetrics>,
    instance_metrics: DashMap<(String, String), HealthMetrics>,
    running: Mutex<Option<Running>>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig, directory: Arc<dyn InstanceDirectory>) -> Self {
        Self::with_probe(config, directory, Arc::new(HttpHealthProbe::default()))
    }

    pub fn with_probe(
        config: HealthCheckConfig,
        directory: Arc<dyn InstanceDirectory>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            config,
            probe,
            directory,
            observers: RwLock::new(Vec::new()),
            health_paths: DashMap::new(),
            service_metrics: DashMap::new(),
            instance_metrics: DashMap::new(),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    pub fn add_observer(&self, observer: Arc<dyn HealthObserver>) {
        self.observers.write().push(observer);
    }

    /// Register a service for polling. If the checker is already running a
    /// poller is started for it straight away.
    pub fn register_service(self: &Arc<Self>, service: &str, health_path: &str) {
        self.health_paths
            .insert(service.to_string(), health_path.to_string());

        let mut running = self.running.lock();
        if let Some(running) = running.as_mut() {
            if !running.handles.contains_key(service) {
                let handle = self.spawn_poller(service.to_string(), running.token.clone());
                running.handles.insert(service.to_string(), handle);
            }
        }
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<_> = self.health_paths.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Launch one polling task per registered service. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let handles = self
            .services()
            .into_iter()
            .map(|service| {
                let handle = self.spawn_poller(service.clone(), token.clone());
                (service, handle)
            })
            .collect::<HashMap<_, _>>();

        info!(
            services = handles.len(),
            interval = ?self.config.interval,
            "🩺 Health checker started"
        );
        *running = Some(Running { token, handles });
    }

    /// Cancel all pollers and wait for them to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        running.token.cancel();
        for (service, handle) in running.handles {
            if let Err(e) = handle.await {
                warn!(service = %service, error = %e, "Health poller ended abnormally");
            }
        }
        info!("Health checker stopped");
    }

    fn spawn_poller(self: &Arc<Self>, service: String, token: CancellationToken) -> JoinHandle<()> {
        let checker = Arc::clone(self);
        tokio::spawn(async move {
            debug!(service = %service, "Health poller started");
            loop {
                let delay = match checker.check_service(&service).await {
                    Ok(_) => checker.config.interval,
                    Err(e) => {
                        warn!(service = %service, error = %e, "Health poll failed, backing off");
                        checker.config.failure_backoff
                    }
                };

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!(service = %service, "Health poller stopped");
        })
    }

    /// Probe every instance of `service` once and record the results.
    pub async fn check_service(&self, service: &str) -> GatewayResult<HealthStatus> {
        let health_path = self
            .health_paths
            .get(service)
            .map(|p| p.value().clone())
            .ok_or_else(|| GatewayError::service_unavailable(service, "not registered for health checks"))?;

        let urls = self.directory.instance_urls(service);
        if urls.is_empty() {
            return Err(GatewayError::service_unavailable(service, "no instances registered"));
        }

        let probes = urls.iter().map(|base| {
            let target = format!("{}{}", base.trim_end_matches('/'), health_path);
            async move { self.probe.probe(&target, self.config.timeout).await }
        });
        let outcomes = join_all(probes).await;

        for (url, outcome) in urls.iter().zip(outcomes.iter()) {
            self.record(service, url, outcome);
        }

        Ok(self.service_status(service))
    }

    /// Fold one probe outcome into the instance and service metrics and
    /// notify observers.
    pub fn record(&self, service: &str, instance_url: &str, outcome: &ProbeOutcome) {
        counter!(
            "health_check_total",
            "service" => service.to_string(),
            "result" => if outcome.success { "success" } else { "failure" }
        )
        .increment(1);

        let instance_status = {
            let mut metrics = self
                .instance_metrics
                .entry((service.to_string(), instance_url.to_string()))
                .or_default();
            let (from, to) = metrics.record(outcome);
            if from != to {
                log_transition(service, Some(instance_url), from, to, metrics.last_error());
            }
            to
        };

        {
            let mut metrics = self.service_metrics.entry(service.to_string()).or_default();
            let (from, to) = metrics.record(outcome);
            if from != to {
                log_transition(service, None, from, to, metrics.last_error());
            }
        }

        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_probe(service, instance_url, outcome.success, instance_status);
        }
    }

    /// Probe every registered service right now, outside the schedule.
    pub async fn check_all_now(&self) -> HashMap<String, ServiceHealthReport> {
        let services = self.services();
        let checks = services.iter().map(|service| async move {
            if let Err(e) = self.check_service(service).await {
                debug!(service = %service, error = %e, "Immediate health check skipped");
            }
        });
        join_all(checks).await;

        self.reports()
    }

    pub fn service_status(&self, service: &str) -> HealthStatus {
        self.service_metrics
            .get(service)
            .map(|m| m.status())
            .unwrap_or(HealthStatus::Unknown)
    }

    pub fn instance_status(&self, service: &str, instance_url: &str) -> HealthStatus {
        self.instance_metrics
            .get(&(service.to_string(), instance_url.to_string()))
            .map(|m| m.status())
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Drop the metrics kept for a deregistered instance. Service-level
    /// metrics keep their history.
    pub fn forget_instance(&self, service: &str, instance_url: &str) -> bool {
        let removed = self
            .instance_metrics
            .remove(&(service.to_string(), instance_url.to_string()))
            .is_some();
        if removed {
            debug!(service = %service, instance = %instance_url, "Dropped instance health metrics");
        }
        removed
    }

    pub fn service_metrics(&self, service: &str) -> Option<HealthMetrics> {
        self.service_metrics.get(service).map(|m| m.clone())
    }

    pub fn report(&self, service: &str) -> ServiceHealthReport {
        let metrics = self
            .service_metrics
            .get(service)
            .map(|m| m.report())
            .unwrap_or_else(|| HealthMetrics::default().report());

        let mut instances: Vec<_> = self
            .instance_metrics
            .iter()
            .filter(|entry| entry.key().0 == service)
            .map(|entry| InstanceHealthReport {
                url: entry.key().1.clone(),
                metrics: entry.value().report(),
            })
            .collect();
        instances.sort_by(|a, b| a.url.cmp(&b.url));

        ServiceHealthReport {
            service: service.to_string(),
            metrics,
            instances,
        }
    }

    pub fn reports(&self) -> HashMap<String, ServiceHealthReport> {
        self.services()
            .into_iter()
            .map(|service| {
                let report = self.report(&service);
                (service, report)
            })
            .collect()
    }
}

fn log_transition(
    service: &str,
    instance: Option<&str>,
    from: HealthStatus,
    to: HealthStatus,
    last_error: Option<&str>,
) {
    let instance = instance.unwrap_or("*");
    match to {
        HealthStatus::Unhealthy | HealthStatus::Degraded => warn!(
            service = %service,
            instance = %instance,
            from = from.as_str(),
            to = to.as_str(),
            last_error = last_error.unwrap_or(""),
            "Health status changed"
        ),
        _ => info!(
            service = %service,
            instance = %instance,
            from = from.as_str(),
            to = to.as_str(),
            "Health status changed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn outcomes(successes: usize, failures: usize, latency: Duration) -> Vec<ProbeOutcome> {
        let mut all: Vec<_> = (0..failures)
            .map(|_| ProbeOutcome::failure(latency, "connection refused"))
            .collect();
        all.extend((0..successes).map(|_| ProbeOutcome::success(latency)));
        all
    }

    fn metrics_after(outcomes: &[ProbeOutcome]) -> HealthMetrics {
        let mut metrics = HealthMetrics::default();
        for outcome in outcomes {
            metrics.record(outcome);
        }
        metrics
    }

    #[test]
    fn test_status_derivation_table() {
        assert_eq!(derive_status(None, None), HealthStatus::Unknown);
        assert_eq!(
            derive_status(Some(0.0), Some(Duration::from_millis(100))),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            derive_status(Some(0.7), Some(Duration::from_millis(100))),
            HealthStatus::Degraded
        );
        assert_eq!(
            derive_status(Some(0.9), Some(Duration::from_secs(6))),
            HealthStatus::Degraded
        );
        assert_eq!(
            derive_status(Some(1.0), Some(Duration::from_millis(200))),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn test_metrics_from_recorded_checks() {
        let unhealthy = metrics_after(&outcomes(0, 10, Duration::from_millis(200)));
        assert_eq!(unhealthy.status(), HealthStatus::Unhealthy);
        assert_eq!(unhealthy.error_count(), 10);
        assert_eq!(unhealthy.last_error(), Some("connection refused"));

        let degraded = metrics_after(&outcomes(7, 3, Duration::from_millis(200)));
        assert_eq!(degraded.success_rate(), Some(0.7));
        assert_eq!(degraded.status(), HealthStatus::Degraded);

        let slow = metrics_after(&outcomes(9, 1, Duration::from_secs(6)));
        assert_eq!(slow.status(), HealthStatus::Degraded);

        let healthy = metrics_after(&outcomes(10, 0, Duration::from_millis(200)));
        assert_eq!(healthy.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_rolling_window_only_counts_recent_checks() {
        let mut all = outcomes(0, 20, Duration::from_millis(10));
        all.extend(outcomes(10, 0, Duration::from_millis(10)));
        let metrics = metrics_after(&all);
        assert_eq!(metrics.success_rate(), Some(1.0));
        assert_eq!(metrics.status(), HealthStatus::Healthy);
        assert_eq!(metrics.error_count(), 20);
    }

    #[test]
    fn test_history_is_bounded() {
        let metrics = metrics_after(&outcomes(150, 0, Duration::from_millis(10)));
        assert_eq!(metrics.history().len(), HISTORY_CAPACITY);
    }

    struct StaticDirectory(HashMap<String, Vec<String>>);

    impl InstanceDirectory for StaticDirectory {
        fn instance_urls(&self, service: &str) -> Vec<String> {
            self.0.get(service).cloned().unwrap_or_default()
        }
    }

    /// Fails any URL containing "down", succeeds otherwise.
    struct ScriptedProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, url: &str, _timeout: Duration) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if url.contains("down") {
                ProbeOutcome::failure(Duration::from_millis(5), "connection refused")
            } else {
                ProbeOutcome::success(Duration::from_millis(5))
            }
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<(String, bool, HealthStatus)>>,
    }

    impl HealthObserver for RecordingObserver {
        fn on_probe(&self, _service: &str, instance_url: &str, success: bool, status: HealthStatus) {
            self.events.lock().push((instance_url.to_string(), success, status));
        }
    }

    fn checker(probe: Arc<ScriptedProbe>) -> Arc<HealthChecker> {
        let mut services = HashMap::new();
        services.insert(
            "accounts".to_string(),
            vec!["http://up:1".to_string(), "http://down:2".to_string()],
        );
        let config = HealthCheckConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(1),
            failure_backoff: Duration::from_secs(5),
            unhealthy_threshold: 3,
        };
        Arc::new(HealthChecker::with_probe(
            config,
            Arc::new(StaticDirectory(services)),
            probe,
        ))
    }

    #[tokio::test]
    async fn test_check_all_now_feeds_metrics_and_observers() {
        let probe = Arc::new(ScriptedProbe {
            calls: AtomicUsize::new(0),
        });
        let checker = checker(probe.clone());
        let observer = Arc::new(RecordingObserver::default());
        checker.add_observer(observer.clone());
        checker.register_service("accounts", "/health");

        let reports = checker.check_all_now().await;
        let report = &reports["accounts"];
        assert_eq!(report.metrics.status, HealthStatus::Degraded);
        assert_eq!(report.instances.len(), 2);
        assert_eq!(
            checker.instance_status("accounts", "http://down:2"),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            checker.instance_status("accounts", "http://up:1"),
            HealthStatus::Healthy
        );
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
        assert_eq!(observer.events.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_forgotten_instance_leaves_reports() {
        let checker = checker(Arc::new(ScriptedProbe {
            calls: AtomicUsize::new(0),
        }));
        checker.register_service("accounts", "/health");
        checker.check_service("accounts").await.unwrap();
        assert_eq!(checker.report("accounts").instances.len(), 2);

        assert!(checker.forget_instance("accounts", "http://down:2"));
        assert!(!checker.forget_instance("accounts", "http://down:2"));

        let report = checker.report("accounts");
        assert_eq!(report.instances.len(), 1);
        assert_eq!(report.instances[0].url, "http://up:1");
        assert_eq!(report.metrics.total_checks, 2);
        assert_eq!(
            checker.instance_status("accounts", "http://down:2"),
            HealthStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_unregistered_service_is_an_error() {
        let checker = checker(Arc::new(ScriptedProbe {
            calls: AtomicUsize::new(0),
        }));
        assert!(checker.check_service("accounts").await.is_err());
        assert_eq!(checker.service_status("accounts"), HealthStatus::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pollers_run_on_interval_and_stop_cleanly() {
        let probe = Arc::new(ScriptedProbe {
            calls: AtomicUsize::new(0),
        });
        let checker = checker(probe.clone());
        checker.register_service("accounts", "/health");
        checker.start();
        assert!(checker.is_running());

        tokio::time::sleep(Duration::from_secs(25)).await;
        // Polls at t=0, 10 and 20, two instances each.
        assert_eq!(probe.calls.load(Ordering::SeqCst), 6);

        checker.stop().await;
        assert!(!checker.is_running());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_uses_backoff() {
        let probe = Arc::new(ScriptedProbe {
            calls: AtomicUsize::new(0),
        });
        let checker = checker(probe.clone());
        checker.register_service("payments", "/health");
        checker.start();

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        checker.stop().await;
    }
}
