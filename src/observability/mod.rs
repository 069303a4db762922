//! Health checking, structured logging and metrics exposition.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{
    HealthCheckConfig, HealthChecker, HealthMetrics, HealthObserver, HealthProbe, HealthStatus,
    HttpHealthProbe, InstanceDirectory, ProbeOutcome, ServiceHealthReport,
};
pub use logging::{init_logging, LoggingConfig, AUDIT_TARGET};
pub use self::metrics::prometheus_handle;
