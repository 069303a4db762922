pub mod audit;
pub mod auth;
pub mod cache;
pub mod circuit_breaker;
pub mod rate_limiting;
pub mod request_logging;
pub mod request_metrics;
pub mod security;

pub use audit::audit_middleware;
pub use auth::{auth_middleware, AuthConfig, AuthState, TokenVerifier};
pub use cache::{cache_middleware, CacheConfig, ResponseCache};
pub use circuit_breaker::{CircuitBreakerLayer, CircuitBreakerMiddleware};
pub use rate_limiting::{
    rate_limit_middleware, FallbackLimiter, InMemoryStore, RateLimit, RateLimitConfig,
    RateLimitMiddleware, RateLimitStore, RedisStore,
};
pub use request_logging::request_logging_middleware;
pub use request_metrics::request_metrics_middleware;
pub use security::{cors_layer, security_headers, trusted_host_middleware, AllowedHosts};
