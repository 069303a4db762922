//! # Authentication
//!
//! Bearer tokens are issued by the identity service; the gateway only
//! verifies them. A verified token becomes an [`AuthContext`] in the request
//! extensions so later stages (cache, audit, forwarding) can use the caller's
//! identity without re-parsing.
//!
//! - no `Authorization` header: the request continues anonymously
//! - a token that fails verification: 401
//! - admin-only routes: 401 when anonymous, 403 without the `admin` role

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::AuthContext;
use crate::routing::RouteTable;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 shared secret
    pub jwt_secret: String,

    /// Expected `iss` claim, unchecked when absent
    pub issuer: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me".to_string(),
            issuer: None,
        }
    }
}

/// Claims the gateway reads from a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(&config.jwt_secret, config.issuer.as_deref())
    }

    pub fn verify(&self, token: &str) -> GatewayResult<AuthContext> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(AuthContext {
            user_id: data.claims.sub,
            roles: data.claims.roles,
        })
    }

    /// Bearer token from the `Authorization` header, if any.
    pub fn bearer(headers: &HeaderMap) -> Option<&str> {
        headers
            .get(axum::http::header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Identity from the headers when a valid token is present. Invalid
    /// tokens yield `None`; rejecting them is the auth stage's job.
    pub fn peek(&self, headers: &HeaderMap) -> Option<AuthContext> {
        Self::bearer(headers).and_then(|token| self.verify(token).ok())
    }
}

#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<TokenVerifier>,
    pub routes: Arc<RouteTable>,
}

/// Paths that require the admin role in addition to admin-only routes.
const ADMIN_PREFIX: &str = "/admin/";

fn requires_admin(routes: &RouteTable, path: &str) -> bool {
    path.starts_with(ADMIN_PREFIX) || routes.resolve(path).is_some_and(|route| route.admin_only)
}

pub async fn auth_middleware(State(auth): State<AuthState>, mut request: Request, next: Next) -> Response {
    let identity = match TokenVerifier::bearer(request.headers()) {
        Some(token) => match auth.verifier.verify(token) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                warn!(path = %request.uri().path(), error = %e, "Rejected invalid bearer token");
                return GatewayError::auth("invalid or expired token").into_response();
            }
        },
        None => None,
    };

    if requires_admin(&auth.routes, request.uri().path()) {
        match &identity {
            None => return GatewayError::auth("authentication required").into_response(),
            Some(ctx) if !ctx.is_admin() => {
                warn!(user_id = %ctx.user_id, path = %request.uri().path(), "Admin route denied");
                return GatewayError::authz("admin role required").into_response();
            }
            Some(_) => {}
        }
    }

    if let Some(ctx) = identity {
        debug!(user_id = %ctx.user_id, "Authenticated request");
        request.extensions_mut().insert(ctx);
    }
    next.run(request).await
}
