//! Routing table mapping decoded requests to upstream clusters.
//!
//! The engine consumes the [`Router`] trait; [`RouteTable`] is the concrete
//! implementation: path and header conditions evaluated most-specific-first,
//! each route carrying its cluster, retry and timeout policy. Loadable from
//! TOML or JSON.

use crate::cluster::UpstreamProtocol;
use crate::headers::Headers;
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutPolicy;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Compiled route patterns, shared process-wide so evaluating a route never
/// recompiles a regex.
static PATTERN_CACHE: Lazy<RwLock<HashMap<String, Arc<Regex>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Looks up a compiled pattern, compiling and caching it on first use.
/// A pattern that does not compile never matches.
fn cached_regex(pattern: &str) -> Option<Arc<Regex>> {
    if let Some(regex) = PATTERN_CACHE.read().get(pattern) {
        return Some(Arc::clone(regex));
    }

    let compiled = match Regex::new(pattern) {
        Ok(regex) => Arc::new(regex),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "route pattern does not compile");
            return None;
        }
    };

    // two callers may compile the same pattern concurrently; first in wins
    PATTERN_CACHE
        .write()
        .entry(pattern.to_string())
        .or_insert_with(|| Arc::clone(&compiled));
    Some(compiled)
}

/// Condition on a request header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeaderMatch {
    /// Header must carry exactly this value.
    Exact { name: String, value: String },
    /// Header must contain this substring.
    Contains { name: String, value: String },
    /// Header must match this pattern.
    Regex { name: String, pattern: String },
    /// Header must be present, whatever the value.
    Present { name: String },
    /// Header must not appear at all.
    Absent { name: String },
}

impl HeaderMatch {
    /// Requires a header to carry exactly `value`.
    pub fn exact(name: impl Into<String>, value: impl Into<String>) -> Self {
        HeaderMatch::Exact {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Requires a header to be present with any value.
    pub fn present(name: impl Into<String>) -> Self {
        HeaderMatch::Present { name: name.into() }
    }

    /// Requires a header to be absent.
    pub fn absent(name: impl Into<String>) -> Self {
        HeaderMatch::Absent { name: name.into() }
    }

    /// True when the request headers satisfy this condition.
    pub fn test(&self, headers: &Headers) -> bool {
        match self {
            HeaderMatch::Exact { name, value } => headers.get(name) == Some(value.as_str()),
            HeaderMatch::Contains { name, value } => headers
                .get(name)
                .is_some_and(|found| found.contains(value.as_str())),
            HeaderMatch::Regex { name, pattern } => {
                match (headers.get(name), cached_regex(pattern)) {
                    (Some(found), Some(regex)) => regex.is_match(found),
                    _ => false,
                }
            }
            HeaderMatch::Present { name } => headers.contains(name),
            HeaderMatch::Absent { name } => !headers.contains(name),
        }
    }
}

/// Condition on the request path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathMatch {
    /// Path must equal this value.
    Exact { path: String },
    /// Path must begin with this prefix.
    Prefix { prefix: String },
    /// Path must match this pattern.
    Regex { pattern: String },
}

impl PathMatch {
    /// Exact path condition.
    pub fn exact(path: impl Into<String>) -> Self {
        PathMatch::Exact { path: path.into() }
    }

    /// Prefix path condition.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        PathMatch::Prefix {
            prefix: prefix.into(),
        }
    }

    /// True when the request path satisfies this condition.
    pub fn test(&self, path: &str) -> bool {
        match self {
            PathMatch::Exact { path: want } => path == want,
            PathMatch::Prefix { prefix } => path.starts_with(prefix.as_str()),
            PathMatch::Regex { pattern } => {
                cached_regex(pattern).is_some_and(|regex| regex.is_match(path))
            }
        }
    }

    /// Evaluation-order key: exact conditions beat prefixes, longer
    /// prefixes beat shorter ones, and regex conditions come last.
    fn specificity(&self) -> (u8, usize) {
        match self {
            PathMatch::Exact { path } => (3, path.len()),
            PathMatch::Prefix { prefix } => (2, prefix.len()),
            PathMatch::Regex { .. } => (1, 0),
        }
    }
}

/// The routing facts the engine consumes from a matched route.
#[derive(Debug, Clone)]
pub struct RouteRule {
    /// Route name, surfaced in request info and access logs.
    pub name: String,
    /// Target upstream cluster.
    pub cluster_name: String,
    /// Retry policy for streams bound to this route.
    pub retry_policy: RetryPolicy,
    /// Timeout policy for streams bound to this route.
    pub timeout_policy: TimeoutPolicy,
    /// Metadata-match criteria handed to the load balancer.
    pub metadata_match: HashMap<String, String>,
}

/// A matched route.
pub trait Route {
    fn rule(&self) -> &RouteRule;
}

/// Route lookup consumed by the stream engine.
pub trait Router {
    /// Returns the route for the given request headers, or `None` if no
    /// rule matches. `attempt` is 1 for the initial lookup.
    fn route(&self, headers: &Headers, attempt: u32) -> Option<Rc<dyn Route>>;
}

struct CompiledRoute {
    rule: RouteRule,
}

impl Route for CompiledRoute {
    fn rule(&self) -> &RouteRule {
        &self.rule
    }
}

/// A single routing rule in the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Unique name for this route.
    pub name: String,
    /// Virtual host: exact match on the `host` (or `:authority`) header.
    /// `None` matches any host.
    #[serde(default)]
    pub host: Option<String>,
    /// Path matching condition against the `:path` header.
    pub path: PathMatch,
    /// Header conditions; every one must hold.
    #[serde(default)]
    pub headers: Vec<HeaderMatch>,
    /// Name of the upstream cluster this route targets.
    pub cluster: String,
    /// Retry policy for streams on this route.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Timeout policy for streams on this route.
    #[serde(default)]
    pub timeout: TimeoutPolicy,
    /// Metadata-match criteria handed to the load balancer.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Whether this route is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RouteEntry {
    /// Creates a new route with the given name, path condition and cluster.
    pub fn new(name: impl Into<String>, path: PathMatch, cluster: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: None,
            path,
            headers: Vec::new(),
            cluster: cluster.into(),
            retry: RetryPolicy::default(),
            timeout: TimeoutPolicy::default(),
            metadata: HashMap::new(),
            enabled: true,
        }
    }

    /// Restricts the route to one virtual host.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Adds a header condition; every condition must hold for a match.
    pub fn with_header(mut self, condition: HeaderMatch) -> Self {
        self.headers.push(condition);
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the timeout policy.
    pub fn with_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks if this route matches the request headers.
    pub fn matches(&self, headers: &Headers) -> bool {
        if !self.enabled {
            return false;
        }

        if let Some(host) = &self.host {
            let request_host = headers.get("host").or_else(|| headers.get(":authority"));
            if request_host != Some(host.as_str()) {
                return false;
            }
        }

        let path = headers.get(":path").unwrap_or("/");
        let path = path.split('?').next().unwrap_or(path);
        if !self.path.test(path) {
            return false;
        }

        self.headers.iter().all(|condition| condition.test(headers))
    }

    fn compile(&self) -> Rc<CompiledRoute> {
        Rc::new(CompiledRoute {
            rule: RouteRule {
                name: self.name.clone(),
                cluster_name: self.cluster.clone(),
                retry_policy: self.retry.clone(),
                timeout_policy: self.timeout,
                metadata_match: self.metadata.clone(),
            },
        })
    }
}

/// Prioritized routing table.
pub struct RouteTable {
    routes: Vec<(RouteEntry, Rc<CompiledRoute>)>,
    default_route: Option<Rc<CompiledRoute>>,
}

impl RouteTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            default_route: None,
        }
    }

    /// Creates a table with the given routes.
    pub fn with_routes(routes: Vec<RouteEntry>) -> Self {
        let mut table = Self::new();
        for route in routes {
            table.add_route(route);
        }
        table
    }

    /// Sets a catch-all cluster for unmatched requests.
    pub fn with_default_cluster(mut self, cluster: impl Into<String>) -> Self {
        let entry = RouteEntry::new("default", PathMatch::prefix("/"), cluster);
        self.default_route = Some(entry.compile());
        self
    }

    /// Adds a route, keeping the table in evaluation order
    /// (most specific path condition first).
    pub fn add_route(&mut self, route: RouteEntry) {
        let compiled = route.compile();
        self.routes.push((route, compiled));
        self.routes
            .sort_by_key(|(entry, _)| std::cmp::Reverse(entry.path.specificity()));
    }

    /// Number of routes in the table, not counting the default.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Router for RouteTable {
    fn route(&self, headers: &Headers, _attempt: u32) -> Option<Rc<dyn Route>> {
        for (entry, compiled) in &self.routes {
            if entry.matches(headers) {
                debug!(
                    route = %entry.name,
                    cluster = %entry.cluster,
                    "matched route"
                );
                return Some(Rc::clone(compiled) as Rc<dyn Route>);
            }
        }

        if let Some(default_route) = &self.default_route {
            debug!(
                cluster = %default_route.rule.cluster_name,
                "using default cluster"
            );
            return Some(Rc::clone(default_route) as Rc<dyn Route>);
        }

        debug!(path = headers.get(":path").unwrap_or("-"), "no matching route found");
        None
    }
}

/// One upstream cluster in the routing config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamCluster {
    /// Endpoint addresses, e.g. `http://127.0.0.1:8080`.
    pub endpoints: Vec<String>,
    /// Protocol family spoken to this cluster.
    #[serde(default)]
    pub protocol: UpstreamProtocol,
}

/// File-loadable routing configuration: the routes plus the clusters they
/// refer to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Routing rules, in any order.
    pub routes: Vec<RouteEntry>,
    /// Upstream clusters, keyed by name.
    pub upstreams: HashMap<String, UpstreamCluster>,
    /// Catch-all cluster for unmatched requests.
    #[serde(default)]
    pub default_cluster: Option<String>,
}

impl RoutingConfig {
    /// Parses a TOML routing config.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Parses a JSON routing config.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Builds the routing table this config describes.
    pub fn build_router(&self) -> RouteTable {
        let mut table = RouteTable::with_routes(self.routes.clone());
        if let Some(default) = &self.default_cluster {
            table = table.with_default_cluster(default.clone());
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_condition_exact() {
        let condition = PathMatch::exact("/api/users");
        assert!(condition.test("/api/users"));
        assert!(!condition.test("/api/users/"));
        assert!(!condition.test("/api"));
    }

    #[test]
    fn test_path_condition_prefix() {
        let condition = PathMatch::prefix("/api/");
        assert!(condition.test("/api/users"));
        assert!(condition.test("/api/posts"));
        assert!(!condition.test("/other"));
    }

    #[test]
    fn test_path_condition_regex() {
        let condition = PathMatch::Regex {
            pattern: r"^/api/users/\d+$".to_string(),
        };
        assert!(condition.test("/api/users/123"));
        assert!(!condition.test("/api/users/abc"));
    }

    #[test]
    fn test_path_condition_bad_pattern_never_matches() {
        let condition = PathMatch::Regex {
            pattern: "(unclosed".to_string(),
        };
        assert!(!condition.test("/anything"));
    }

    #[test]
    fn test_header_condition_exact() {
        let condition = HeaderMatch::exact("content-type", "application/json");
        let mut headers = Headers::from([("content-type", "application/json")]);
        assert!(condition.test(&headers));

        headers.set("content-type", "text/plain");
        assert!(!condition.test(&headers));
    }

    #[test]
    fn test_header_condition_present_absent() {
        let present = HeaderMatch::present("authorization");
        let absent = HeaderMatch::absent("authorization");
        let mut headers = Headers::new();

        assert!(!present.test(&headers));
        assert!(absent.test(&headers));

        headers.set("authorization", "Bearer token");
        assert!(present.test(&headers));
        assert!(!absent.test(&headers));
    }

    #[test]
    fn test_route_entry_matching() {
        let route = RouteEntry::new("api-route", PathMatch::prefix("/api/"), "api-cluster")
            .with_header(HeaderMatch::present("authorization"));

        let headers = Headers::from([(":path", "/api/users"), ("authorization", "Bearer token")]);
        assert!(route.matches(&headers));

        let without_auth = Headers::from([(":path", "/api/users")]);
        assert!(!route.matches(&without_auth));
    }

    #[test]
    fn test_route_host_matching() {
        let route = RouteEntry::new("vh", PathMatch::prefix("/"), "server_1")
            .with_host("192.168.100.100");

        let matching = Headers::from([(":path", "/"), ("host", "192.168.100.100")]);
        assert!(route.matches(&matching));

        let wrong_host = Headers::from([(":path", "/"), ("host", "10.0.0.1")]);
        assert!(!route.matches(&wrong_host));
    }

    #[test]
    fn test_route_table_prefers_exact_over_prefix() {
        let mut table = RouteTable::new();

        // insertion order must not matter
        table.add_route(RouteEntry::new("prefix", PathMatch::prefix("/api/"), "a"));
        table.add_route(RouteEntry::new(
            "exact",
            PathMatch::exact("/api/users"),
            "b",
        ));

        let headers = Headers::from([(":path", "/api/users")]);
        assert_eq!(table.route(&headers, 1).unwrap().rule().name, "exact");
    }

    #[test]
    fn test_route_table_prefers_longer_prefix() {
        let mut table = RouteTable::new();
        table.add_route(RouteEntry::new("short", PathMatch::prefix("/api/"), "a"));
        table.add_route(RouteEntry::new(
            "long",
            PathMatch::prefix("/api/users/"),
            "b",
        ));

        let headers = Headers::from([(":path", "/api/users/42")]);
        assert_eq!(table.route(&headers, 1).unwrap().rule().name, "long");

        let other = Headers::from([(":path", "/api/posts")]);
        assert_eq!(table.route(&other, 1).unwrap().rule().name, "short");
    }

    #[test]
    fn test_route_table_default_cluster() {
        let table = RouteTable::new().with_default_cluster("default-cluster");

        let headers = Headers::from([(":path", "/unmatched")]);
        let route = table.route(&headers, 1).unwrap();

        assert_eq!(route.rule().cluster_name, "default-cluster");
    }

    #[test]
    fn test_route_table_no_match() {
        let table = RouteTable::new();
        let headers = Headers::from([(":path", "/unmatched")]);
        assert!(table.route(&headers, 1).is_none());
    }

    #[test]
    fn test_query_string_ignored() {
        let route = RouteEntry::new("exact", PathMatch::exact("/api"), "cluster");
        let headers = Headers::from([(":path", "/api?page=2")]);
        assert!(route.matches(&headers));
    }

    #[test]
    fn test_routing_config_from_toml() {
        let config = RoutingConfig::from_toml(
            r#"
            default_cluster = "fallback"

            [[routes]]
            name = "api"
            cluster = "api-cluster"

            [routes.path]
            type = "prefix"
            prefix = "/api/"

            [upstreams.api-cluster]
            endpoints = ["http://127.0.0.1:8080"]
            protocol = "http1"
            "#,
        )
        .unwrap();

        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.upstreams["api-cluster"].endpoints.len(), 1);

        let table = config.build_router();
        assert_eq!(table.route_count(), 1);
        let headers = Headers::from([(":path", "/api/v1")]);
        assert_eq!(table.route(&headers, 1).unwrap().rule().cluster_name, "api-cluster");

        let fallback = Headers::from([(":path", "/other")]);
        assert_eq!(table.route(&fallback, 1).unwrap().rule().cluster_name, "fallback");
    }
}
