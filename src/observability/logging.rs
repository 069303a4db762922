//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. Everything in the crate logs with
//! structured fields (`service`, `instance`, `status`, ...) so JSON output can
//! be indexed without parsing messages. Audit events use the `audit` target
//! and can be routed separately with a filter such as `audit=info`.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Tracing target for audit events.
pub const AUDIT_TARGET: &str = "audit";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base directive used when `RUST_LOG` is not set
    pub level: String,

    /// JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl LoggingConfig {
    /// Filter directives derived from the configured level.
    pub fn directives(&self) -> String {
        format!(
            "banking_gateway={level},tower_http={level},{target}={level}",
            level = self.level,
            target = AUDIT_TARGET
        )
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
/// A second call leaves the existing subscriber in place.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directives()));

    let result = if config.json {
        Registry::default()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init()
    } else {
        Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };

    match result {
        Ok(()) => info!(level = %config.level, json = config.json, "Structured logging initialized"),
        Err(_) => warn!("Tracing subscriber already initialized, skipping initialization"),
    }
}
