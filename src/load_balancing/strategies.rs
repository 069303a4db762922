//! # Selection Strategies
//!
//! The strategy is a closed set chosen in configuration. Each variant is a pure
//! selection over the routable candidates of one service; the only state a
//! strategy needs (the round-robin cursor) is owned by the service pool and
//! passed in.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::instance::ServiceInstance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Per-service counter modulo candidate count
    #[default]
    RoundRobin,
    /// Lowest load score
    LeastConnections,
    /// Lowest smoothed response time; unmeasured instances go first
    LeastResponseTime,
    Random,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::LeastResponseTime => "least_response_time",
            Self::Random => "random",
        }
    }

    /// Index into `candidates` of the chosen instance, or `None` when empty.
    pub fn select(
        &self,
        candidates: &[Arc<ServiceInstance>],
        cursor: &AtomicUsize,
    ) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let index = match self {
            Self::RoundRobin => cursor.fetch_add(1, Ordering::Relaxed) % candidates.len(),
            Self::LeastConnections => min_index_by(candidates, |i| i.load_score()),
            Self::LeastResponseTime => {
                min_index_by(candidates, |i| i.avg_response_time_ms().unwrap_or(0.0))
            }
            Self::Random => rand::thread_rng().gen_range(0..candidates.len()),
        };
        Some(index)
    }
}

fn min_index_by<F>(candidates: &[Arc<ServiceInstance>], key: F) -> usize
where
    F: Fn(&ServiceInstance) -> f64,
{
    candidates
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| key(a).total_cmp(&key(b)))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Self::RoundRobin),
            "least_connections" => Ok(Self::LeastConnections),
            "least_response_time" => Ok(Self::LeastResponseTime),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown load balancing strategy '{}'", other)),
        }
    }
}
