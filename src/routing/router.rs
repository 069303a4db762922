//! # Route Table
//!
//! Static mapping from a public path prefix to the logical backend service
//! that serves it. Resolution is a longest-prefix match on segment
//! boundaries, so `/api/v1/accounts` matches `/api/v1/accounts` and
//! `/api/v1/accounts/42` but never `/api/v1/accountsx`.
//!
//! The service name returned here is the key shared by the load balancer,
//! the health checker and the circuit breakers.

use serde::{Deserialize, Serialize};

/// One proxied prefix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Route {
    pub prefix: String,
    pub service: String,

    /// Requires the `admin` role
    #[serde(default)]
    pub admin_only: bool,

    /// Drop `prefix` from the path sent downstream
    #[serde(default)]
    pub strip_prefix: bool,
}

impl Route {
    pub fn new(prefix: &str, service: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            service: service.to_string(),
            admin_only: false,
            strip_prefix: false,
        }
    }

    pub fn admin_only(mut self) -> Self {
        self.admin_only = true;
        self
    }

    pub fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Path to request from the backend.
    pub fn downstream_path<'a>(&self, path: &'a str) -> &'a str {
        if !self.strip_prefix {
            return path;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some("") => "/",
            Some(rest) => rest,
            None => path,
        }
    }
}

/// The gateway's public routes, ordered longest prefix first.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        let mut routes: Vec<Route> = routes
            .into_iter()
            .map(|mut r| {
                r.prefix = r.prefix.trim_end_matches('/').to_string();
                r
            })
            .collect();
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    /// Default banking routes under `/api/v1`.
    pub fn default_routes() -> Vec<Route> {
        [
            ("customers", "customers"),
            ("accounts", "accounts"),
            ("transactions", "transactions"),
            ("payments", "payments"),
            ("transfers", "transfers"),
            ("loans", "loans"),
            ("notifications", "notifications"),
        ]
        .iter()
        .map(|(segment, service)| Route::new(&format!("/api/v1/{}", segment), service))
        .chain(std::iter::once(Route::new("/api/v1/audit", "audit").admin_only()))
        .collect()
    }

    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(path))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Distinct service names referenced by the table.
    pub fn services(&self) -> Vec<&str> {
        let mut services: Vec<&str> = self.routes.iter().map(|r| r.service.as_str()).collect();
        services.sort_unstable();
        services.dedup();
        services
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(Self::default_routes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_boundary_matching() {
        let table = RouteTable::default();
        assert_eq!(table.resolve("/api/v1/accounts").unwrap().service, "accounts");
        assert_eq!(
            table.resolve("/api/v1/accounts/42/balance").unwrap().service,
            "accounts"
        );
        assert!(table.resolve("/api/v1/accountsx").is_none());
        assert!(table.resolve("/api/v2/accounts").is_none());
        assert!(table.resolve("/health").is_none());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RouteTable::new(vec![
            Route::new("/api/v1/payments", "payments"),
            Route::new("/api/v1/payments/upi", "upi-gateway"),
        ]);
        assert_eq!(
            table.resolve("/api/v1/payments/upi/collect").unwrap().service,
            "upi-gateway"
        );
        assert_eq!(table.resolve("/api/v1/payments/neft").unwrap().service, "payments");
    }

    #[test]
    fn test_audit_is_admin_only() {
        let table = RouteTable::default();
        assert!(table.resolve("/api/v1/audit/logs").unwrap().admin_only);
        assert!(!table.resolve("/api/v1/loans").unwrap().admin_only);
        assert_eq!(table.services().len(), 8);
    }

    #[test]
    fn test_downstream_path() {
        let mut route = Route::new("/api/v1/loans/", "loans");
        assert_eq!(route.prefix, "/api/v1/loans");
        assert_eq!(route.downstream_path("/api/v1/loans/7"), "/api/v1/loans/7");

        route.strip_prefix = true;
        assert_eq!(route.downstream_path("/api/v1/loans/7"), "/7");
        assert_eq!(route.downstream_path("/api/v1/loans"), "/");
    }
}
