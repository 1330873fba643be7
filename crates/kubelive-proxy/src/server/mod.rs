//! Emulation proxy server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use kubelive_common::Bundle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::logging::{log_requests, RequestLog, TracingRequestLog};
use crate::logs::serve_pod_logs;
use crate::passthrough::forward;
use crate::rewrite::RewriteChain;
use crate::routes::{RouteStrategy, RouteTable};
use crate::upstream::UpstreamClient;

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// Shared state for handlers
#[derive(Clone)]
pub struct ProxyState {
    /// Captured snapshot
    pub bundle: Arc<dyn Bundle>,
    /// Ephemeral API server
    pub upstream: Arc<dyn UpstreamClient>,
    /// Intercepted routes
    pub routes: Arc<RouteTable>,
    /// Rules applied to passthrough responses
    pub rewrite: Arc<RewriteChain>,
}

/// Reverse proxy presenting the bundle as a live cluster
pub struct EmulationProxy {
    state: ProxyState,
    request_log: Arc<dyn RequestLog>,
}

impl EmulationProxy {
    /// Proxy with the default routes, the standard rewrite rules and
    /// tracing-based request logging
    pub fn new(bundle: Arc<dyn Bundle>, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self {
            state: ProxyState {
                bundle,
                upstream,
                routes: Arc::new(RouteTable::default()),
                rewrite: Arc::new(RewriteChain::standard()),
            },
            request_log: Arc::new(TracingRequestLog),
        }
    }

    /// Replace the route table
    pub fn with_routes(mut self, routes: RouteTable) -> Self {
        self.state.routes = Arc::new(routes);
        self
    }

    /// Replace the rewrite rules
    pub fn with_rewrite(mut self, rewrite: RewriteChain) -> Self {
        self.state.rewrite = Arc::new(rewrite);
        self
    }

    /// Replace the request log sink
    pub fn with_request_log(mut self, request_log: Arc<dyn RequestLog>) -> Self {
        self.request_log = request_log;
        self
    }

    /// Build the axum router; every route is wrapped by the request logger
    pub fn router(&self) -> Router {
        Router::new()
            // Health check
            .route("/healthz", get(|| async { "ok" }))
            // Everything else goes through the route table
            .fallback(dispatch)
            .with_state(self.state.clone())
            .layer(axum::middleware::from_fn_with_state(
                self.request_log.clone(),
                log_requests,
            ))
    }
}

/// Resolve the request against the route table and run its strategy
async fn dispatch(
    State(state): State<ProxyState>,
    request: Request<Body>,
) -> std::result::Result<Response, Error> {
    let matched = state.routes.resolve(request.method(), request.uri().path());
    debug!(
        method = %request.method(),
        path = %request.uri().path(),
        strategy = ?matched.strategy,
        "Routing request"
    );

    match matched.strategy {
        RouteStrategy::PodLogs => {
            serve_pod_logs(state.bundle.as_ref(), &matched.params, request.uri())
        }
        RouteStrategy::Passthrough => {
            forward(state.upstream.as_ref(), &state.rewrite, request).await
        }
    }
}

/// Serve `proxy` until `shutdown` is cancelled
///
/// In-flight requests are allowed to finish after shutdown begins.
pub async fn serve(
    config: ServerConfig,
    proxy: EmulationProxy,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .map_err(|e| Error::Config(format!("failed to bind {}: {}", config.addr, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| Error::Internal(format!("failed to read listener address: {}", e)))?;

    info!(addr = %local_addr, "Starting emulation proxy");

    axum::serve(listener, proxy.router())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Server error: {}", e)))?;

    info!("Emulation proxy stopped");
    Ok(())
}
