//! # Configuration Module
//!
//! Gateway configuration is a single YAML document. Every section has
//! serde defaults, so an empty file (or no file at all) yields a gateway
//! that proxies the default banking services on localhost.
//!
//! ## Loading order
//! 1. YAML file (`GATEWAY_CONFIG_PATH`, default `config/gateway.yaml`)
//! 2. Environment variable overrides (`GATEWAY_*`)
//! 3. Validation, reporting every problem at once

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::circuit_breaker::CircuitBreakerSettings;
use crate::core::error::{GatewayError, GatewayResult};
use crate::load_balancing::LoadBalancingStrategy;
use crate::middleware::auth::AuthConfig;
use crate::middleware::cache::CacheConfig;
use crate::middleware::rate_limiting::RateLimitConfig;
use crate::observability::health::HealthCheckConfig;
use crate::observability::logging::LoggingConfig;
use crate::routing::{Route, RouteTable};

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,

    /// Backend services by logical name
    pub services: BTreeMap<String, ServiceConfig>,

    pub routes: Vec<Route>,

    pub load_balancing: LoadBalancingConfig,

    pub health_check: HealthCheckConfig,

    pub circuit_breaker: CircuitBreakerSettings,

    pub rate_limiting: RateLimitConfig,

    pub auth: AuthConfig,

    pub cache: CacheConfig,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,

    /// Overrides the crate version in `X-Gateway-Version`
    pub gateway_version: Option<String>,

    /// Deadline for one forwarded request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Accepted `Host` values; empty accepts any
    pub allowed_hosts: Vec<String>,

    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            gateway_version: None,
            request_timeout: Duration::from_secs(30),
            allowed_hosts: Vec::new(),
            cors_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub instances: Vec<InstanceConfig>,

    pub health_check_path: String,

    /// Readiness fails while a critical service is unhealthy
    pub critical: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            health_check_path: "/health".to_string(),
            critical: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "http".to_string()
}

impl InstanceConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            protocol: default_protocol(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub strategy: LoadBalancingStrategy,
}

/// The banking services and the local ports they listen on in development.
const DEFAULT_SERVICES: [(&str, u16, bool); 8] = [
    ("customers", 8001, true),
    ("accounts", 8002, true),
    ("transactions", 8003, true),
    ("payments", 8004, true),
    ("transfers", 8005, false),
    ("loans", 8006, false),
    ("notifications", 8007, false),
    ("audit", 8008, false),
];

impl GatewayConfig {
    /// Read, override and validate a YAML file.
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| {
                GatewayError::config(format!(
                    "Failed to read config file {}: {}",
                    path.as_ref().display(),
                    e
                ))
            })?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document and fill in default services and routes when
    /// the document leaves them out.
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        let mut config: GatewayConfig = if content.trim().is_empty() {
            GatewayConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?
        };
        config.fill_defaults();
        Ok(config)
    }

    /// Defaults plus the built-in services and routes.
    pub fn with_defaults() -> Self {
        let mut config = Self::default();
        config.fill_defaults();
        config
    }

    fn fill_defaults(&mut self) {
        if self.services.is_empty() {
            self.services = DEFAULT_SERVICES
                .iter()
                .map(|(name, port, critical)| {
                    (
                        name.to_string(),
                        ServiceConfig {
                            instances: vec![InstanceConfig::new("localhost", *port)],
                            critical: *critical,
                            ..ServiceConfig::default()
                        },
                    )
                })
                .collect();
        }
        if self.routes.is_empty() {
            self.routes = RouteTable::default_routes();
        }
    }

    /// Apply `GATEWAY_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Overrides from any key lookup. Unset keys leave the value untouched.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("GATEWAY_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(url) = lookup("GATEWAY_REDIS_URL") {
            self.rate_limiting.redis_url = Some(url).filter(|u| !u.is_empty());
        }

        if let Some(secret) = lookup("GATEWAY_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }

        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(timeout) = lookup("GATEWAY_REQUEST_TIMEOUT") {
            self.server.request_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_REQUEST_TIMEOUT: {}", e))
            })?;
        }

        if let Some(strategy) = lookup("GATEWAY_LB_STRATEGY") {
            self.load_balancing.strategy = strategy
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_LB_STRATEGY: {}", e)))?;
        }

        Ok(())
    }

    /// Comprehensive configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("server.bind_address cannot be empty".to_string());
        } else if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "server.bind_address '{}' is not a socket address",
                self.server.bind_address
            ));
        }

        if self.server.request_timeout.is_zero() {
            errors.push("server.request_timeout must be greater than 0".to_string());
        }

        for (name, service) in &self.services {
            if service.instances.is_empty() {
                errors.push(format!("Service '{}' has no instances", name));
            }
            for instance in &service.instances {
                if instance.host.is_empty() {
                    errors.push(format!("Service '{}' has an instance with an empty host", name));
                }
                if instance.port == 0 {
                    errors.push(format!("Service '{}' instance {} has port 0", name, instance.host));
                }
                if !matches!(instance.protocol.as_str(), "http" | "https") {
                    errors.push(format!(
                        "Service '{}' instance {} has unsupported protocol '{}'",
                        name, instance.host, instance.protocol
                    ));
                }
            }
            if !service.health_check_path.starts_with('/') {
                errors.push(format!(
                    "Service '{}' health_check_path must start with '/'",
                    name
                ));
            }
        }

        for route in &self.routes {
            if !route.prefix.starts_with('/') {
                errors.push(format!("Route prefix '{}' must start with '/'", route.prefix));
            }
            if !self.services.contains_key(&route.service) {
                errors.push(format!(
                    "Route '{}' references unknown service '{}'",
                    route.prefix, route.service
                ));
            }
        }

        if self.health_check.interval.is_zero() {
            errors.push("health_check.interval must be greater than 0".to_string());
        }
        if self.health_check.timeout.is_zero() {
            errors.push("health_check.timeout must be greater than 0".to_string());
        }
        if self.health_check.unhealthy_threshold == 0 {
            errors.push("health_check.unhealthy_threshold must be greater than 0".to_string());
        }

        let breakers = std::iter::once(("default", &self.circuit_breaker.defaults)).chain(
            self.circuit_breaker
                .services
                .iter()
                .map(|(name, cb)| (name.as_str(), cb)),
        );
        for (name, cb) in breakers {
            if cb.failure_threshold == 0 {
                errors.push(format!(
                    "circuit_breaker '{}' failure_threshold must be greater than 0",
                    name
                ));
            }
            if cb.half_open_successes == 0 {
                errors.push(format!(
                    "circuit_breaker '{}' half_open_successes must be greater than 0",
                    name
                ));
            }
        }

        if let Some(redis_url) = &self.rate_limiting.redis_url {
            match url::Url::parse(redis_url) {
                Ok(parsed) if matches!(parsed.scheme(), "redis" | "rediss") => {}
                Ok(parsed) => errors.push(format!(
                    "rate_limiting.redis_url has unsupported scheme '{}'",
                    parsed.scheme()
                )),
                Err(e) => errors.push(format!("rate_limiting.redis_url is invalid: {}", e)),
            }
        }

        errors.extend(
            self.rate_limiting
                .invalid_limits()
                .into_iter()
                .map(|e| format!("rate_limiting.{}", e)),
        );

        if self.auth.jwt_secret.is_empty() {
            errors.push("auth.jwt_secret cannot be empty".to_string());
        }

        if self.cache.enabled && self.cache.max_entries == 0 {
            errors.push("cache.max_entries must be greater than 0 when caching is enabled".to_string());
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!("Invalid log level: {}", self.logging.level)),
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }

    /// Services whose health gates readiness.
    pub fn critical_services(&self) -> Vec<String> {
        self.services
            .iter()
            .filter(|(_, s)| s.critical)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_validation() {
        let config = GatewayConfig::with_defaults();
        assert!(config.validate().is_ok());
        assert_eq!(config.services.len(), 8);
        assert_eq!(
            config.services["accounts"].instances,
            vec![InstanceConfig::new("localhost", 8002)]
        );
        assert_eq!(
            config.critical_services(),
            vec!["accounts", "customers", "payments", "transactions"]
        );
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = GatewayConfig::from_yaml("").unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.routes.len(), 8);
    }

    #[tokio::test]
    async fn test_load_config_from_yaml_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gateway.yaml");

        let config_content = r#"
server:
  bind_address: "127.0.0.1:9080"
  request_timeout: 10s
services:
  accounts:
    instances:
      - host: accounts-1
        port: 8002
      - host: accounts-2
        port: 8002
        protocol: https
    critical: true
routes:
  - prefix: /api/v1/accounts
    service: accounts
load_balancing:
  strategy: least_connections
health_check:
  interval: 15s
  unhealthy_threshold: 5
circuit_breaker:
  failure_threshold: 3
  recovery_timeout: 30s
  services:
    accounts:
      failure_threshold: 10
rate_limiting:
  redis_url: redis://cache:6379
  default_limit: 50/minute
"#;
        tokio::fs::write(&config_path, config_content).await.unwrap();

        let config = GatewayConfig::load_from_file(&config_path).await.unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:9080");
        assert_eq!(config.server.request_timeout, Duration::from_secs(10));
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services["accounts"].instances[1].protocol, "https");
        assert_eq!(config.services["accounts"].health_check_path, "/health");
        assert_eq!(
            config.load_balancing.strategy,
            LoadBalancingStrategy::LeastConnections
        );
        assert_eq!(config.health_check.interval, Duration::from_secs(15));
        assert_eq!(config.health_check.timeout, Duration::from_secs(5));
        assert_eq!(config.health_check.unhealthy_threshold, 5);
        assert_eq!(config.circuit_breaker.config_for("accounts").failure_threshold, 10);
        assert_eq!(config.circuit_breaker.config_for("loans").failure_threshold, 3);
        assert_eq!(
            config.rate_limiting.redis_url.as_deref(),
            Some("redis://cache:6379")
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_a_configuration_error() {
        let err = GatewayConfig::load_from_file("/definitely/not/here.yaml")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("GATEWAY_BIND_ADDRESS", "127.0.0.1:7000"),
            ("GATEWAY_REDIS_URL", "redis://127.0.0.1:6379"),
            ("GATEWAY_JWT_SECRET", "from-env"),
            ("GATEWAY_REQUEST_TIMEOUT", "2s"),
            ("GATEWAY_LB_STRATEGY", "least-response-time"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::with_defaults();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.bind_address, "127.0.0.1:7000");
        assert_eq!(
            config.rate_limiting.redis_url.as_deref(),
            Some("redis://127.0.0.1:6379")
        );
        assert_eq!(config.auth.jwt_secret, "from-env");
        assert_eq!(config.server.request_timeout, Duration::from_secs(2));
        assert_eq!(
            config.load_balancing.strategy,
            LoadBalancingStrategy::LeastResponseTime
        );
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = GatewayConfig::with_defaults();
        let result = config.apply_overrides(|key| {
            (key == "GATEWAY_REQUEST_TIMEOUT").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_collects_every_error() {
        let mut config = GatewayConfig::with_defaults();
        config.server.bind_address = "not-an-address".to_string();
        config.routes.push(Route::new("/api/v1/cards", "cards"));
        config.rate_limiting.default_limit = "lots".to_string();
        config.circuit_breaker.defaults.failure_threshold = 0;
        config.rate_limiting.redis_url = Some("http://cache:6379".to_string());
        config.health_check.unhealthy_threshold = 0;

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("bind_address"));
        assert!(message.contains("unknown service 'cards'"));
        assert!(message.contains("rate_limiting.default_limit"));
        assert!(message.contains("failure_threshold"));
        assert!(message.contains("unsupported scheme 'http'"));
        assert!(message.contains("unhealthy_threshold"));
    }
}
