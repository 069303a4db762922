//! # Circuit Breaker
//!
//! One breaker guards each logical backend service. It is a small state
//! machine driven by the outcomes the gateway observes for that service:
//!
//! ```text
//!            failures >= threshold               recovery timeout elapsed
//!   Closed ─────────────────────────▶ Open ───────────────────────────▶ HalfOpen
//!     ▲                                ▲                                   │
//!     │        N consecutive successes │            any failure            │
//!     └────────────────────────────────┼───────────────────────────────────┘
//!                                      └───────────────────────────────────┘
//! ```
//!
//! - While **closed**, a success decays `failure_count` by one instead of
//!   resetting it, so a single good response does not erase a run of errors.
//! - While **open**, calls are rejected without touching the network. Rejections
//!   are counted separately from `total_requests`.
//! - While **half-open**, probes flow through; three successes (configurable)
//!   close the breaker and any failure re-opens it.
//!
//! ## Concurrency
//!
//! The mutable state lives behind a `parking_lot::Mutex` that is only held for
//! the few instructions of a transition, never across an `.await`. Counters that
//! are read by dashboards use atomics so snapshots never contend with requests.
//!
//! Time is measured with `tokio::time::Instant`, which lets tests pause and
//! advance the clock instead of sleeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, GatewayResult};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Tuning knobs for a breaker.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures (net of decay) that open a closed breaker
    pub failure_threshold: u32,

    /// Time since the last failure before an open breaker lets a probe through
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// Consecutive half-open successes needed to close
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_successes: 3,
        }
    }
}

/// Breaker settings for the whole gateway: a default plus per-service overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    #[serde(flatten)]
    pub defaults: CircuitBreakerConfig,

    pub services: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerSettings {
    pub fn config_for(&self, service: &str) -> &CircuitBreakerConfig {
        self.services.get(service).unwrap_or(&self.defaults)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Per-service circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_requests: AtomicU64,
    rejected_requests: AtomicU64,
    total_failures: AtomicU64,
}

/// Point-in-time view of a breaker, served by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub total_failures: u64,
    pub seconds_since_last_failure: Option<f64>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
            total_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn rejected_requests(&self) -> u64 {
        self.rejected_requests.load(Ordering::Relaxed)
    }

    /// Gate a call. An open breaker whose recovery timeout has elapsed moves
    /// to half-open and admits the call.
    pub fn should_allow(&self) -> bool {
        self.can_proceed().is_ok()
    }

    /// Like [`should_allow`](Self::should_allow) but returns the rejection as a
    /// gateway error carrying the remaining cool-down.
    pub fn can_proceed(&self) -> GatewayResult<()> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|at| at.elapsed())
                .unwrap_or(self.config.recovery_timeout);

            if elapsed < self.config.recovery_timeout {
                drop(inner);
                self.rejected_requests.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("circuit_breaker_rejections_total", "service" => self.name.clone())
                    .increment(1);
                debug!(service = %self.name, "Circuit open, rejecting request");
                return Err(GatewayError::CircuitBreakerOpen {
                    service: self.name.clone(),
                    retry_after: self.config.recovery_timeout - elapsed,
                });
            }

            inner.success_count = 0;
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_successes {
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // A slow response that started before the breaker opened.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                inner.success_count = 0;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            service: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            seconds_since_last_failure: inner.last_failure.map(|at| at.elapsed().as_secs_f64()),
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;

        metrics::counter!(
            "circuit_breaker_transitions_total",
            "service" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);

        match to {
            CircuitState::Open => warn!(
                service = %self.name,
                from = from.as_str(),
                failure_count = inner.failure_count,
                "Circuit breaker opened"
            ),
            _ => info!(
                service = %self.name,
                from = from.as_str(),
                to = to.as_str(),
                "Circuit breaker state changed"
            ),
        }
    }
}

/// Lazily creates one breaker per service name.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: CircuitBreakerSettings,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            breakers: DashMap::new(),
            settings,
        }
    }

    pub fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return existing.clone();
        }
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service,
                    self.settings.config_for(service).clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).map(|entry| entry.clone())
    }

    /// Snapshots sorted by service name.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}
