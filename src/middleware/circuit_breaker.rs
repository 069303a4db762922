//! # Circuit Breaker Middleware
//!
//! Tower layer that gates proxied requests on the circuit breaker of their
//! target service. The service is found through the [`RouteTable`]; requests
//! that match no route (health, metrics, admin) pass straight through.
//!
//! Outcome classification:
//!
//! - status `>= 500` (including the gateway's own 502/503/504) is a failure
//! - anything else, 4xx included, is a success
//!
//! While the breaker is open the inner service is never called and the
//! caller receives a 503 with a `Retry-After` hint.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::debug;

use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::routing::RouteTable;

#[derive(Clone)]
pub struct CircuitBreakerLayer {
    registry: Arc<CircuitBreakerRegistry>,
    routes: Arc<RouteTable>,
}

impl CircuitBreakerLayer {
    pub fn new(registry: Arc<CircuitBreakerRegistry>, routes: Arc<RouteTable>) -> Self {
        Self { registry, routes }
    }

    pub fn registry(&self) -> Arc<CircuitBreakerRegistry> {
        Arc::clone(&self.registry)
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerMiddleware {
            inner,
            registry: Arc::clone(&self.registry),
            routes: Arc::clone(&self.routes),
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreakerMiddleware<S> {
    inner: S,
    registry: Arc<CircuitBreakerRegistry>,
    routes: Arc<RouteTable>,
}

impl<S> Service<Request> for CircuitBreakerMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let Some(service) = self
            .routes
            .resolve(request.uri().path())
            .map(|route| route.service.clone())
        else {
            return Box::pin(self.inner.call(request));
        };

        let breaker = self.registry.get_or_create(&service);
        if let Err(rejection) = breaker.can_proceed() {
            debug!(service = %service, "Short-circuiting request");
            return Box::pin(async move { Ok(rejection.into_response()) });
        }

        let future = self.inner.call(request);
        Box::pin(async move {
            let response = future.await?;
            if is_failure(&response) {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }
            Ok(response)
        })
    }
}

fn is_failure(response: &Response) -> bool {
    response.status().is_server_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerSettings, CircuitState};
    use axum::body::Body;
    use axum::http::StatusCode;
    use std::convert::Infallible;
    use std::time::Duration;
    use tower::util::BoxCloneService;
    use tower::{service_fn, ServiceExt};

    fn registry() -> Arc<CircuitBreakerRegistry> {
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerSettings {
            defaults: CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
                half_open_successes: 3,
            },
            ..Default::default()
        }))
    }

    fn request(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    fn backend(status: StatusCode) -> BoxCloneService<Request, Response, Infallible> {
        BoxCloneService::new(service_fn(move |_req: Request| async move {
            Ok::<_, Infallible>((status, "backend").into_response())
        }))
    }

    #[tokio::test]
    async fn test_server_errors_open_the_breaker() {
        let registry = registry();
        let layer = CircuitBreakerLayer::new(registry.clone(), Arc::new(RouteTable::default()));
        let svc = layer.layer(backend(StatusCode::BAD_GATEWAY));

        for _ in 0..2 {
            let response = svc.clone().oneshot(request("/api/v1/accounts/1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        }
        assert_eq!(registry.get("accounts").unwrap().state(), CircuitState::Open);

        let response = svc.clone().oneshot(request("/api/v1/accounts/1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_failures() {
        let registry = registry();
        let layer = CircuitBreakerLayer::new(registry.clone(), Arc::new(RouteTable::default()));
        let svc = layer.layer(backend(StatusCode::NOT_FOUND));

        for _ in 0..5 {
            let response = svc.clone().oneshot(request("/api/v1/loans/9")).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
        let breaker = registry.get("loans").unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_unrouted_paths_bypass_breakers() {
        let registry = registry();
        let layer = CircuitBreakerLayer::new(registry.clone(), Arc::new(RouteTable::default()));
        let svc = layer.layer(backend(StatusCode::SERVICE_UNAVAILABLE));

        for _ in 0..3 {
            svc.clone().oneshot(request("/health/ready")).await.unwrap();
        }
        assert!(registry.snapshots().is_empty());
    }
}
