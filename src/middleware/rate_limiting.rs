//! # Rate Limiting
//!
//! Sliding-window-log rate limiting keyed by `(identity, method, path)`.
//!
//! ## Algorithm
//!
//! Each key owns an ordered log of admission timestamps. On every check the
//! entries older than `now - window` are dropped, and the request is admitted
//! only if fewer than `limit` entries remain, in which case `now` is appended.
//! Pruning, counting and appending happen atomically per key:
//!
//! - [`RedisStore`] runs them in a single Lua script against a sorted set, so
//!   every gateway process shares the same windows.
//! - [`InMemoryStore`] runs them under the key's `DashMap` entry lock.
//!
//! ## Availability
//!
//! [`FallbackLimiter`] tries the shared store first and drops to the
//! in-process store whenever the shared one errors or is inside its
//! reconnect backoff. The choice is made per request, so the gateway keeps
//! limiting (per process) during a Redis outage and returns to shared limits as
//! soon as Redis answers again.
//!
//! ## Limit resolution
//!
//! 1. exact endpoint override (`"POST /api/v1/payments"`)
//! 2. role limit (`admin`, `customer`, `system`; most permissive wins)
//! 3. path heuristic on the version-stripped path (`/auth/`, `/transactions`, ...)
//! 4. global default
//!
//! Limits are written `"<count>/<unit>"` with unit `second`, `minute`, `hour`
//! or `day` (plural accepted).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use metrics::counter;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{client_ip, headers, AuthContext};
use crate::middleware::auth::TokenVerifier;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Invalid rate limit '{0}': expected <count>/<second|minute|hour|day>")]
    InvalidLimit(String),
    #[error("Rate limit store unavailable: {0}")]
    Unavailable(String),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// `max` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u64,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max: u64, window: Duration) -> Self {
        Self { max, window }
    }

    pub fn window_ms(&self) -> i64 {
        self.window.as_millis() as i64
    }

    /// Requests per second, used to compare limits with different windows.
    pub fn rate(&self) -> f64 {
        self.max as f64 / self.window.as_secs_f64()
    }
}

impl FromStr for RateLimit {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RateLimitError::InvalidLimit(s.to_string());
        let (count, unit) = s.split_once('/').ok_or_else(invalid)?;
        let max: u64 = count.trim().parse().map_err(|_| invalid())?;

        let unit = unit.trim().to_ascii_lowercase();
        let window = match unit.strip_suffix('s').unwrap_or(&unit) {
            "second" => Duration::from_secs(1),
            "minute" => Duration::from_secs(60),
            "hour" => Duration::from_secs(3_600),
            "day" => Duration::from_secs(86_400),
            _ => return Err(invalid()),
        };
        Ok(Self { max, window })
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.window.as_secs() {
            1 => "second",
            60 => "minute",
            3_600 => "hour",
            86_400 => "day",
            other => return write!(f, "{}/{}s", self.max, other),
        };
        write!(f, "{}/{}", self.max, unit)
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub window: Duration,
    pub remaining: u64,
    /// Time until the oldest entry in the window expires
    pub reset_after: Duration,
}

impl RateLimitDecision {
    fn from_window(allowed: bool, limit: &RateLimit, count: u64, oldest_ms: i64, now_ms: i64) -> Self {
        let reset_ms = (oldest_ms + limit.window_ms() - now_ms).max(0);
        Self {
            allowed,
            limit: limit.max,
            window: limit.window,
            remaining: limit.max.saturating_sub(count),
            reset_after: Duration::from_millis(reset_ms as u64),
        }
    }
}

/// Capability interface over a sliding-window log store.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prune, count and conditionally insert `now_ms` for `key`, atomically.
    async fn admit(
        &self,
        key: &str,
        limit: &RateLimit,
        now_ms: i64,
    ) -> Result<RateLimitDecision, RateLimitError>;
}

#[derive(Debug)]
struct WindowLog {
    timestamps: VecDeque<i64>,
    window_ms: i64,
}

/// Process-local store.
#[derive(Debug)]
pub struct InMemoryStore {
    windows: DashMap<String, WindowLog>,
    checks: AtomicU64,
    prune_every: u64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
            prune_every: 1_024,
        }
    }

    pub fn key_count(&self) -> usize {
        self.windows.len()
    }

    /// Drop keys whose newest entry has left its window.
    pub fn prune_stale(&self, now_ms: i64) {
        let before = self.windows.len();
        self.windows.retain(|_, log| {
            log.timestamps
                .back()
                .is_some_and(|newest| *newest >= now_ms - log.window_ms)
        });
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, "Pruned stale rate limit windows");
        }
    }

    fn admit_local(&self, key: &str, limit: &RateLimit, now_ms: i64) -> RateLimitDecision {
        let window_ms = limit.window_ms();
        let decision = {
            let mut log = self.windows.entry(key.to_string()).or_insert_with(|| WindowLog {
                timestamps: VecDeque::new(),
                window_ms,
            });
            log.window_ms = window_ms;

            let cutoff = now_ms - window_ms;
            while log.timestamps.front().is_some_and(|ts| *ts < cutoff) {
                log.timestamps.pop_front();
            }

            let count = log.timestamps.len() as u64;
            let allowed = count < limit.max;
            if allowed {
                log.timestamps.push_back(now_ms);
            }
            let count = log.timestamps.len() as u64;
            let oldest = log.timestamps.front().copied().unwrap_or(now_ms);
            RateLimitDecision::from_window(allowed, limit, count, oldest, now_ms)
        };

        if self.checks.fetch_add(1, Ordering::Relaxed) % self.prune_every == self.prune_every - 1 {
            self.prune_stale(now_ms);
        }
        decision
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn admit(
        &self,
        key: &str,
        limit: &RateLimit,
        now_ms: i64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        Ok(self.admit_local(key, limit, now_ms))
    }
}

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. (now - window))
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  count = count + 1
  allowed = 1
end
redis.call('PEXPIRE', key, window)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ts = now
if oldest[2] then
  oldest_ts = tonumber(oldest[2])
end
return {allowed, count, oldest_ts}
"#;

/// Shared store backed by Redis sorted sets.
pub struct RedisStore {
    client: redis::Client,
    script: redis::Script,
    connection: tokio::sync::Mutex<Option<ConnectionManager>>,
    timeout: Duration,
    retry_after: Duration,
    unavailable_until_ms: AtomicI64,
}

impl RedisStore {
    /// Validates the URL only; the connection is opened on first use.
    pub fn new(url: &str, timeout: Duration, retry_after: Duration) -> Result<Self, RateLimitError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            script: redis::Script::new(SLIDING_WINDOW_SCRIPT),
            connection: tokio::sync::Mutex::new(None),
            timeout,
            retry_after,
            unavailable_until_ms: AtomicI64::new(0),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, RateLimitError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = tokio::time::timeout(self.timeout, ConnectionManager::new(self.client.clone()))
            .await
            .map_err(|_| RateLimitError::Unavailable("connect timed out".to_string()))??;
        info!("Connected to shared rate limit store");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    fn mark_unavailable(&self, now_ms: i64) {
        self.unavailable_until_ms
            .store(now_ms + self.retry_after.as_millis() as i64, Ordering::Relaxed);
    }

    async fn run_script(
        &self,
        key: &str,
        limit: &RateLimit,
        now_ms: i64,
    ) -> Result<Vec<i64>, RateLimitError> {
        let mut conn = self.connection().await?;
        let member = format!("{}-{}", now_ms, uuid::Uuid::new_v4());
        let mut invocation = self.script.key(key);
        invocation
            .arg(now_ms)
            .arg(limit.window_ms())
            .arg(limit.max)
            .arg(member);

        let reply = tokio::time::timeout(self.timeout, invocation.invoke_async::<_, Vec<i64>>(&mut conn))
            .await
            .map_err(|_| RateLimitError::Unavailable("script timed out".to_string()))??;
        Ok(reply)
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn admit(
        &self,
        key: &str,
        limit: &RateLimit,
        now_ms: i64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        if now_ms < self.unavailable_until_ms.load(Ordering::Relaxed) {
            return Err(RateLimitError::Unavailable("in reconnect backoff".to_string()));
        }

        match self.run_script(key, limit, now_ms).await {
            Ok(reply) => match reply.as_slice() {
                [allowed, count, oldest] => Ok(RateLimitDecision::from_window(
                    *allowed == 1,
                    limit,
                    (*count).max(0) as u64,
                    *oldest,
                    now_ms,
                )),
                other => Err(RateLimitError::Unavailable(format!(
                    "unexpected script reply: {:?}",
                    other
                ))),
            },
            Err(e) => {
                self.mark_unavailable(now_ms);
                Err(e)
            }
        }
    }
}

/// Shared store with automatic in-process fallback.
pub struct FallbackLimiter {
    primary: Option<Arc<dyn RateLimitStore>>,
    fallback: Arc<InMemoryStore>,
    degraded: AtomicBool,
}

impl FallbackLimiter {
    pub fn new(primary: Option<Arc<dyn RateLimitStore>>) -> Self {
        Self {
            primary,
            fallback: Arc::new(InMemoryStore::new()),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn local_only() -> Self {
        Self::new(None)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn fallback(&self) -> &InMemoryStore {
        &self.fallback
    }

    pub async fn admit(&self, key: &str, limit: &RateLimit, now_ms: i64) -> RateLimitDecision {
        if let Some(primary) = &self.primary {
            match primary.admit(key, limit, now_ms).await {
                Ok(decision) => {
                    if self.degraded.swap(false, Ordering::Relaxed) {
                        info!(store = primary.name(), "Shared rate limit store recovered");
                    }
                    return decision;
                }
                Err(e) => {
                    if !self.degraded.swap(true, Ordering::Relaxed) {
                        warn!(
                            store = primary.name(),
                            error = %e,
                            "Shared rate limit store unreachable, limiting per process"
                        );
                    }
                    counter!("gateway_rate_limit_store_fallback_total").increment(1);
                }
            }
        }
        self.fallback.admit_local(key, limit, now_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Shared store; in-process only when absent
    pub redis_url: Option<String>,

    pub default_limit: String,

    /// Role name to limit
    pub role_limits: HashMap<String, String>,

    /// Path prefix (after `/api/vN`) to limit
    pub path_limits: BTreeMap<String, String>,

    /// `"METHOD /exact/path"` to limit
    pub endpoint_limits: HashMap<String, String>,

    /// Requests under these prefixes are never limited
    pub exempt_paths: Vec<String>,

    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,

    /// How long to skip the shared store after it fails
    #[serde(with = "humantime_serde")]
    pub store_retry_after: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let role_limits = [
            ("admin", "1000/minute"),
            ("customer", "100/minute"),
            ("system", "5000/minute"),
        ];
        let path_limits = [
            ("/auth/", "10/minute"),
            ("/transactions", "50/minute"),
            ("/payments", "30/minute"),
            ("/accounts", "200/minute"),
        ];

        Self {
            enabled: true,
            redis_url: None,
            default_limit: "100/minute".to_string(),
            role_limits: role_limits
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            path_limits: path_limits
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            endpoint_limits: HashMap::new(),
            exempt_paths: vec!["/health".to_string(), "/metrics".to_string()],
            store_timeout: Duration::from_millis(250),
            store_retry_after: Duration::from_secs(30),
        }
    }
}

impl RateLimitConfig {
    /// Every limit string that fails to parse, formatted for validation output.
    pub fn invalid_limits(&self) -> Vec<String> {
        std::iter::once(("default_limit".to_string(), &self.default_limit))
            .chain(self.role_limits.iter().map(|(k, v)| (format!("role_limits.{}", k), v)))
            .chain(self.path_limits.iter().map(|(k, v)| (format!("path_limits.{}", k), v)))
            .chain(
                self.endpoint_limits
                    .iter()
                    .map(|(k, v)| (format!("endpoint_limits.{}", k), v)),
            )
            .filter(|(_, v)| v.parse::<RateLimit>().is_err())
            .map(|(k, v)| format!("{}: invalid rate limit '{}'", k, v))
            .collect()
    }
}

/// Parsed limits with the resolution order applied.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    default: RateLimit,
    roles: HashMap<String, RateLimit>,
    /// Longest prefix first
    paths: Vec<(String, RateLimit)>,
    endpoints: HashMap<String, RateLimit>,
    exempt: Vec<String>,
}

fn parse_limit(source: &str, value: &str) -> GatewayResult<RateLimit> {
    value
        .parse()
        .map_err(|e: RateLimitError| GatewayError::config(format!("{}: {}", source, e)))
}

impl RateLimitPolicy {
    pub fn from_config(config: &RateLimitConfig) -> GatewayResult<Self> {
        let roles = config
            .role_limits
            .iter()
            .map(|(role, v)| Ok((role.clone(), parse_limit(role, v)?)))
            .collect::<GatewayResult<HashMap<_, _>>>()?;

        let mut paths = config
            .path_limits
            .iter()
            .map(|(prefix, v)| Ok((prefix.clone(), parse_limit(prefix, v)?)))
            .collect::<GatewayResult<Vec<_>>>()?;
        paths.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let endpoints = config
            .endpoint_limits
            .iter()
            .map(|(endpoint, v)| {
                let (method, path) = endpoint.trim().split_once(' ').ok_or_else(|| {
                    GatewayError::config(format!("endpoint limit key '{}' must be 'METHOD /path'", endpoint))
                })?;
                let key = format!("{} {}", method.to_ascii_uppercase(), path.trim());
                Ok((key, parse_limit(endpoint, v)?))
            })
            .collect::<GatewayResult<HashMap<_, _>>>()?;

        Ok(Self {
            default: parse_limit("default_limit", &config.default_limit)?,
            roles,
            paths,
            endpoints,
            exempt: config.exempt_paths.clone(),
        })
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    pub fn resolve(&self, method: &str, path: &str, identity: Option<&AuthContext>) -> RateLimit {
        if let Some(limit) = self.endpoints.get(&format!("{} {}", method, path)) {
            return *limit;
        }

        if let Some(ctx) = identity {
            let by_role = ctx
                .roles
                .iter()
                .filter_map(|role| self.roles.get(role))
                .max_by(|a, b| a.rate().total_cmp(&b.rate()));
            if let Some(limit) = by_role {
                return *limit;
            }
        }

        let unversioned = strip_api_version(path);
        self.paths
            .iter()
            .find(|(prefix, _)| unversioned.starts_with(prefix.as_str()))
            .map(|(_, limit)| *limit)
            .unwrap_or(self.default)
    }
}

/// `/api/v1/payments/7` becomes `/payments/7`; other paths are returned as is.
fn strip_api_version(path: &str) -> &str {
    let Some(rest) = path.strip_prefix("/api/") else {
        return path;
    };
    let (segment, tail) = rest.split_at(rest.find('/').unwrap_or(rest.len()));
    let is_version = segment.len() > 1
        && segment.starts_with('v')
        && segment[1..].chars().all(|c| c.is_ascii_digit());
    if is_version {
        tail
    } else {
        path
    }
}

pub fn rate_limit_key(identity: Option<&AuthContext>, client_ip: &str, method: &str, path: &str) -> String {
    match identity {
        Some(ctx) => format!("rate_limit:user:{}:{}:{}", ctx.user_id, method, path),
        None => format!("rate_limit:ip:{}:{}:{}", client_ip, method, path),
    }
}

/// Everything the rate limit middleware needs.
pub struct RateLimitMiddleware {
    limiter: FallbackLimiter,
    policy: RateLimitPolicy,
    verifier: Arc<TokenVerifier>,
    enabled: bool,
}

impl RateLimitMiddleware {
    pub fn new(config: &RateLimitConfig, verifier: Arc<TokenVerifier>) -> GatewayResult<Self> {
        let primary: Option<Arc<dyn RateLimitStore>> = match &config.redis_url {
            Some(url) => {
                let store = RedisStore::new(url, config.store_timeout, config.store_retry_after)
                    .map_err(|e| GatewayError::config(format!("rate_limiting.redis_url: {}", e)))?;
                Some(Arc::new(store))
            }
            None => None,
        };

        Ok(Self::with_limiter(
            FallbackLimiter::new(primary),
            RateLimitPolicy::from_config(config)?,
            verifier,
            config.enabled,
        ))
    }

    pub fn with_limiter(
        limiter: FallbackLimiter,
        policy: RateLimitPolicy,
        verifier: Arc<TokenVerifier>,
        enabled: bool,
    ) -> Self {
        Self {
            limiter,
            policy,
            verifier,
            enabled,
        }
    }

    pub fn limiter(&self) -> &FallbackLimiter {
        &self.limiter
    }

    /// Key and limit for `request`, or `None` when it is not subject to
    /// limiting.
    pub fn plan(&self, request: &Request) -> Option<(String, RateLimit)> {
        let path = request.uri().path();
        if !self.enabled || self.policy.is_exempt(path) {
            return None;
        }

        // Runs ahead of authentication, so peek at the bearer token here.
        let identity = request
            .extensions()
            .get::<AuthContext>()
            .cloned()
            .or_else(|| self.verifier.peek(request.headers()));
        let method = request.method().as_str();

        let limit = self.policy.resolve(method, path, identity.as_ref());
        let key = rate_limit_key(identity.as_ref(), &client_ip(request), method, path);
        Some((key, limit))
    }

    /// Check `request` against its limit at `now_ms`.
    pub async fn check(&self, request: &Request, now_ms: i64) -> Option<RateLimitDecision> {
        let (key, limit) = self.plan(request)?;
        Some(self.limiter.admit(&key, &limit, now_ms).await)
    }
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision, now_ms: i64) {
    let reset_epoch = (now_ms + decision.reset_after.as_millis() as i64 + 999) / 1000;
    for (name, value) in [
        (headers::RATE_LIMIT_LIMIT, decision.limit.to_string()),
        (headers::RATE_LIMIT_REMAINING, decision.remaining.to_string()),
        (headers::RATE_LIMIT_RESET, reset_epoch.to_string()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
}

pub async fn rate_limit_middleware(
    State(limits): State<Arc<RateLimitMiddleware>>,
    request: Request,
    next: Next,
) -> Response {
    let Some((key, limit)) = limits.plan(&request) else {
        return next.run(request).await;
    };
    let now_ms = chrono::Utc::now().timestamp_millis();
    let decision = limits.limiter.admit(&key, &limit, now_ms).await;

    if !decision.allowed {
        counter!("gateway_rate_limited_total").increment(1);
        debug!(key = %key, limit = %limit, "Rate limit exceeded");
        let mut response = GatewayError::RateLimitExceeded {
            limit: decision.limit,
            window: decision.window,
            retry_after: decision.reset_after,
        }
        .into_response();
        apply_headers(response.headers_mut(), &decision, now_ms);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision, now_ms);
    response
}
