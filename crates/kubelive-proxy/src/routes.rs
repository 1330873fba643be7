//! Static route table
//!
//! Routes are registered before the proxy starts serving and matched in
//! order; the first matching route wins. Anything unmatched is passed
//! through to the upstream API server.

use std::collections::BTreeMap;

use axum::http::Method;

/// Path template of the pod log endpoint
pub const POD_LOGS_TEMPLATE: &str = "/api/v1/namespaces/{namespace}/pods/{pod}/log";

/// How a matched request is handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteStrategy {
    /// Answer from the bundle's stored pod logs
    PodLogs,
    /// Forward upstream and rewrite the response
    Passthrough,
}

/// Parameters captured from `{name}` template segments
pub type PathParams = BTreeMap<String, String>;

/// A method + path template mapped to a strategy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyRoute {
    /// HTTP method the route answers
    pub method: Method,
    /// Path template; `{name}` captures exactly one path segment
    pub template: String,
    /// Handling strategy
    pub strategy: RouteStrategy,
}

impl ProxyRoute {
    /// Create a route
    pub fn new(method: Method, template: impl Into<String>, strategy: RouteStrategy) -> Self {
        Self {
            method,
            template: template.into(),
            strategy,
        }
    }

    /// `GET .../namespaces/{namespace}/pods/{pod}/log` served from the bundle
    pub fn pod_logs() -> Self {
        Self::new(Method::GET, POD_LOGS_TEMPLATE, RouteStrategy::PodLogs)
    }

    /// Captured parameters when `method` and `path` match this route
    pub fn matches(&self, method: &Method, path: &str) -> Option<PathParams> {
        if &self.method != method {
            return None;
        }

        let mut template = self.template.split('/');
        let mut segments = path.split('/');
        let mut params = PathParams::new();
        loop {
            match (template.next(), segments.next()) {
                (None, None) => return Some(params),
                (Some(expected), Some(actual)) => {
                    match expected
                        .strip_prefix('{')
                        .and_then(|name| name.strip_suffix('}'))
                    {
                        Some(name) => {
                            params.insert(name.to_string(), actual.to_string());
                        }
                        None if expected == actual => {}
                        None => return None,
                    }
                }
                _ => return None,
            }
        }
    }
}

/// Result of resolving a request against the table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteMatch {
    /// Strategy of the first matching route, or passthrough
    pub strategy: RouteStrategy,
    /// Captured template parameters
    pub params: PathParams,
}

/// Ordered list of intercepted routes; passthrough is the implicit last entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTable {
    routes: Vec<ProxyRoute>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::empty().with_route(ProxyRoute::pod_logs())
    }
}

impl RouteTable {
    /// Table that passes everything through
    pub fn empty() -> Self {
        Self { routes: Vec::new() }
    }

    /// Append a route after the existing ones
    pub fn with_route(mut self, route: ProxyRoute) -> Self {
        self.routes.push(route);
        self
    }

    /// Registered routes in match order
    pub fn routes(&self) -> &[ProxyRoute] {
        &self.routes
    }

    /// First route matching the request, falling back to passthrough
    pub fn resolve(&self, method: &Method, path: &str) -> RouteMatch {
        self.routes
            .iter()
            .find_map(|route| {
                route.matches(method, path).map(|params| RouteMatch {
                    strategy: route.strategy,
                    params,
                })
            })
            .unwrap_or(RouteMatch {
                strategy: RouteStrategy::Passthrough,
                params: PathParams::new(),
            })
    }
}
