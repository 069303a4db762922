//! # Banking Gateway Library
//!
//! Routing and resilience core of an API gateway that fronts a set of
//! banking backend services (customers, accounts, transactions, payments,
//! transfers, loans, notifications, audit).
//!
//! ## Request flow
//!
//! ```text
//! inbound ─► edge (headers, CORS, host, compression)
//!         ─► rate limit ─► auth ─► cache ─► audit
//!         ─► circuit breaker (per service)
//!         ─► load balancer picks an instance ─► forwarder
//!         ─► outcome recorded ─► response relayed
//! ```
//!
//! The service name resolved from the route table is the only key shared by
//! the load balancer, the health checker and the circuit breakers; none of
//! them hold references to each other.

/// Error types, configuration, circuit breakers and shared types
pub mod core;

/// Server façade, gateway endpoints and the request forwarder
pub mod gateway;

/// Instance registry and selection strategies
pub mod load_balancing;

/// Rate limiting, authentication, caching and the rest of the middleware chain
pub mod middleware;

/// Health checking, structured logging and Prometheus metrics
pub mod observability;

/// Path prefix to service name resolution
pub mod routing;

pub use core::circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use core::config::GatewayConfig;
pub use core::error::{GatewayError, GatewayResult};
pub use gateway::server::GatewayServer;
pub use load_balancing::{LoadBalancingStrategy, ServiceRouter};
pub use observability::health::{HealthChecker, HealthStatus};
