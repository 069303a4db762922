//! # HTTP Server Module
//!
//! The gateway façade. [`GatewayServer`] builds every shared component once
//! from a [`GatewayConfig`] and wires them together:
//!
//! - the [`ServiceRouter`] is both the health checker's instance directory
//!   and its observer, so probe results steer instance selection
//! - the [`RouteTable`] maps path prefixes to the service name shared by the
//!   router, the health checker and the circuit breakers
//! - the middleware chain runs in a fixed order, outermost first:
//!   security headers, CORS, trusted host, compression, rate limit, auth,
//!   cache, audit, circuit breaker, metrics, logging
//!
//! Nothing here is global; tests build as many servers as they like.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post};
use axum::Router as AxumRouter;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::forwarder::Forwarder;
use super::handlers;
use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::GATEWAY_VERSION;
use crate::load_balancing::ServiceRouter;
use crate::middleware::auth::{auth_middleware, AuthState, TokenVerifier};
use crate::middleware::cache::{cache_middleware, ResponseCache};
use crate::middleware::circuit_breaker::CircuitBreakerLayer;
use crate::middleware::rate_limiting::{rate_limit_middleware, RateLimitMiddleware};
use crate::middleware::security::{cors_layer, security_headers, trusted_host_middleware, AllowedHosts};
use crate::middleware::{audit_middleware, request_logging_middleware, request_metrics_middleware};
use crate::observability::health::{HealthChecker, HealthProbe, HealthStatus, InstanceDirectory};
use crate::routing::RouteTable;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub router: Arc<ServiceRouter>,
    pub health: Arc<HealthChecker>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub routes: Arc<RouteTable>,
    pub forwarder: Arc<Forwarder>,
    pub cache: Arc<ResponseCache>,
    pub rate_limiter: Arc<RateLimitMiddleware>,
    pub verifier: Arc<TokenVerifier>,
    pub started_at: Instant,
}

impl GatewayState {
    /// Configured gateway version, or the crate version when none is set.
    pub fn version(&self) -> &str {
        gateway_version(&self.config)
    }

    /// Worst-case view across services: any critical service unhealthy makes
    /// the gateway unhealthy, any other non-healthy service makes it degraded.
    pub fn overall_status(&self) -> HealthStatus {
        let statuses: Vec<(String, HealthStatus)> = self
            .health
            .services()
            .into_iter()
            .map(|service| {
                let status = self.health.service_status(&service);
                (service, status)
            })
            .collect();

        let critical = self.config.critical_services();
        if statuses
            .iter()
            .any(|(name, status)| *status == HealthStatus::Unhealthy && critical.contains(name))
        {
            return HealthStatus::Unhealthy;
        }
        if statuses.iter().all(|(_, s)| *s == HealthStatus::Healthy) {
            return HealthStatus::Healthy;
        }
        if statuses.iter().all(|(_, s)| *s == HealthStatus::Unknown) {
            return HealthStatus::Unknown;
        }
        HealthStatus::Degraded
    }
}

fn gateway_version(config: &GatewayConfig) -> &str {
    config
        .server
        .gateway_version
        .as_deref()
        .unwrap_or(GATEWAY_VERSION)
}

pub struct GatewayServer {
    state: GatewayState,
    bind_address: SocketAddr,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        Self::build(config, None)
    }

    /// Build with a custom health probe instead of HTTP.
    pub fn with_probe(config: GatewayConfig, probe: Arc<dyn HealthProbe>) -> GatewayResult<Self> {
        Self::build(config, Some(probe))
    }

    fn build(config: GatewayConfig, probe: Option<Arc<dyn HealthProbe>>) -> GatewayResult<Self> {
        config.validate()?;
        let bind_address: SocketAddr = config
            .server
            .bind_address
            .parse()
            .map_err(|e| GatewayError::config(format!("Invalid bind address: {}", e)))?;

        let router = Arc::new(
            ServiceRouter::new(config.load_balancing.strategy)
                .with_unhealthy_threshold(config.health_check.unhealthy_threshold),
        );
        for (name, service) in &config.services {
            for instance in &service.instances {
                router.add_instance(name, &instance.host, instance.port, &instance.protocol);
            }
        }

        let directory: Arc<dyn InstanceDirectory> = router.clone();
        let health = Arc::new(match probe {
            Some(probe) => HealthChecker::with_probe(config.health_check.clone(), directory, probe),
            None => HealthChecker::new(config.health_check.clone(), directory),
        });
        health.add_observer(router.clone());
        for (name, service) in &config.services {
            health.register_service(name, &service.health_check_path);
        }

        let verifier = Arc::new(TokenVerifier::from_config(&config.auth));
        let rate_limiter = Arc::new(RateLimitMiddleware::new(
            &config.rate_limiting,
            Arc::clone(&verifier),
        )?);
        let version = gateway_version(&config).to_string();

        let state = GatewayState {
            router,
            health,
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            routes: Arc::new(RouteTable::new(config.routes.clone())),
            forwarder: Arc::new(Forwarder::new(config.server.request_timeout, version)?),
            cache: Arc::new(ResponseCache::new(config.cache.clone())),
            rate_limiter,
            verifier,
            started_at: Instant::now(),
            config: Arc::new(config),
        };

        Ok(Self {
            state,
            bind_address,
        })
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_address
    }

    pub fn service_router(&self) -> Arc<ServiceRouter> {
        Arc::clone(&self.state.router)
    }

    pub fn health_checker(&self) -> Arc<HealthChecker> {
        Arc::clone(&self.state.health)
    }

    pub fn circuit_breakers(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.state.breakers)
    }

    /// The complete application: gateway endpoints, admin API, proxy
    /// fallback and the middleware chain.
    pub fn router(&self) -> AxumRouter {
        let state = self.state.clone();
        let config = &state.config;

        let auth_state = AuthState {
            verifier: Arc::clone(&state.verifier),
            routes: Arc::clone(&state.routes),
        };
        let allowed_hosts = Arc::new(AllowedHosts::new(&config.server.allowed_hosts));

        let admin = AxumRouter::new()
            .route("/admin/services", get(handlers::list_services))
            .route(
                "/admin/services/:service/instances",
                post(handlers::register_instance),
            )
            .route(
                "/admin/services/:service/instances/:host/:port",
                delete(handlers::deregister_instance),
            )
            .route("/admin/circuit-breakers", get(handlers::circuit_breakers))
            .route("/admin/health/check", post(handlers::check_health_now));

        let middleware = ServiceBuilder::new()
            .layer(security_headers())
            .layer(cors_layer(&config.server.cors_origins))
            .layer(from_fn_with_state(allowed_hosts, trusted_host_middleware))
            .layer(CompressionLayer::new())
            .layer(from_fn_with_state(
                Arc::clone(&state.rate_limiter),
                rate_limit_middleware,
            ))
            .layer(from_fn_with_state(auth_state, auth_middleware))
            .layer(from_fn_with_state(Arc::clone(&state.cache), cache_middleware))
            .layer(from_fn(audit_middleware))
            .layer(CircuitBreakerLayer::new(
                Arc::clone(&state.breakers),
                Arc::clone(&state.routes),
            ))
            .layer(from_fn_with_state(
                Arc::clone(&state.routes),
                request_metrics_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .layer(from_fn(request_logging_middleware));

        AxumRouter::new()
            .route("/health", get(handlers::health_check))
            .route("/health/detailed", get(handlers::detailed_health_check))
            .route("/health/live", get(handlers::liveness_check))
            .route("/health/ready", get(handlers::readiness_check))
            .route("/metrics", get(handlers::metrics_handler))
            .merge(admin)
            .fallback(handlers::proxy_handler)
            .with_state(state)
            .layer(middleware)
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.bind_address).await.map_err(|e| {
            GatewayError::internal(format!(
                "Failed to bind gateway server to {}: {}",
                self.bind_address, e
            ))
        })?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener. Health polling runs for the
    /// lifetime of the server and is stopped before this returns.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let app = self.router();

        self.state.health.start();
        info!(
            address = %addr,
            services = self.state.config.services.len(),
            routes = self.state.routes.routes().len(),
            strategy = %self.state.router.strategy(),
            "🌐 API Gateway listening"
        );

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        info!("🛑 Stopping health checks");
        self.state.health.stop().await;

        result.map_err(|e| GatewayError::internal(format!("Gateway server error: {}", e)))
    }
}
