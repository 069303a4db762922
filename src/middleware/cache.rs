//! # Response Cache
//!
//! Short-lived, process-local cache for successful `GET` responses from
//! backend services. Entries are keyed by caller identity plus path and query
//! so one customer never receives another's cached data. Only `200` responses
//! with a known body size below [`MAX_CACHEABLE_BODY`] are stored.
//!
//! A hit replays the stored status, headers and body, except that
//! `x-trace-id` and `x-response-time` describe the current exchange.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes, HttpBody};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::types::{headers, AuthContext};

/// Largest body the cache will buffer.
pub const MAX_CACHEABLE_BODY: u64 = 1024 * 1024;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(30),
            max_entries: 1_000,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct ResponseCache {
    entries: DashMap<String, CachedResponse>,
    config: CacheConfig,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_cacheable(&self, request: &Request) -> bool {
        let path = request.uri().path();
        self.config.enabled
            && request.method() == Method::GET
            && !path.starts_with("/health")
            && !path.starts_with("/metrics")
            && !path.starts_with("/admin")
    }

    fn key(request: &Request) -> String {
        let identity = request
            .extensions()
            .get::<AuthContext>()
            .map(|ctx| ctx.user_id.as_str())
            .unwrap_or("anonymous");
        let target = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}|{}", identity, target)
    }

    fn lookup(&self, key: &str) -> Option<CachedResponse> {
        let hit = self.entries.get(key).map(|entry| entry.value().clone())?;
        if hit.stored_at.elapsed() < self.config.ttl {
            return Some(hit);
        }
        self.entries.remove(key);
        None
    }

    fn store(&self, key: String, entry: CachedResponse) {
        if self.entries.len() >= self.config.max_entries {
            let ttl = self.config.ttl;
            self.entries.retain(|_, cached| cached.stored_at.elapsed() < ttl);
        }
        if self.entries.len() < self.config.max_entries {
            self.entries.insert(key, entry);
        }
    }
}

fn from_cache(cached: CachedResponse, started: Instant) -> Response {
    let mut response = Response::new(Body::from(cached.body));
    *response.status_mut() = cached.status;
    *response.headers_mut() = cached.headers;

    let replayed = response.headers_mut();
    replayed.insert(headers::CACHE, HeaderValue::from_static("HIT"));
    if let Ok(trace_id) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
        replayed.insert(headers::TRACE_ID, trace_id);
    }
    match HeaderValue::from_str(&format!("{}ms", started.elapsed().as_millis())) {
        Ok(elapsed) => {
            replayed.insert(headers::RESPONSE_TIME, elapsed);
        }
        Err(_) => {
            replayed.remove(headers::RESPONSE_TIME);
        }
    }
    response
}

pub async fn cache_middleware(
    State(cache): State<Arc<ResponseCache>>,
    request: Request,
    next: Next,
) -> Response {
    if !cache.is_cacheable(&request) {
        return next.run(request).await;
    }

    let started = Instant::now();
    let key = ResponseCache::key(&request);
    if let Some(cached) = cache.lookup(&key) {
        counter!("gateway_cache_hits_total").increment(1);
        debug!(key = %key, "Cache hit");
        return from_cache(cached, started);
    }
    counter!("gateway_cache_misses_total").increment(1);

    let response = next.run(request).await;
    let small_enough = response
        .body()
        .size_hint()
        .exact()
        .is_some_and(|size| size <= MAX_CACHEABLE_BODY);
    if response.status() != StatusCode::OK || !small_enough {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let body = match axum::body::to_bytes(body, MAX_CACHEABLE_BODY as usize).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to buffer response for caching");
            parts.status = StatusCode::BAD_GATEWAY;
            return Response::from_parts(parts, Body::empty());
        }
    };

    cache.store(
        key,
        CachedResponse {
            status: parts.status,
            headers: parts.headers.clone(),
            body: body.clone(),
            stored_at: Instant::now(),
        },
    );
    parts
        .headers
        .insert(headers::CACHE, HeaderValue::from_static("MISS"));
    Response::from_parts(parts, Body::from(body))
}
