//! Emulation proxy for kubelive
//!
//! Sits between cluster tooling and the ephemeral API server that holds the
//! bundle's objects. Requests the ephemeral server cannot answer (pod logs)
//! are synthesized from the bundle; everything else is forwarded upstream
//! and the response is rewritten so that it looks like the captured cluster.
//!
//! # Request flow
//!
//! ```text
//! client ──► log_requests ──► RouteTable::resolve
//!                                 │
//!              PodLogs ◄──────────┼──────────► Passthrough
//!                 │                                │
//!          Bundle::lookup_logs         UpstreamClient ──► RewriteChain
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod kubeconfig;
pub mod logging;
pub mod logs;
pub mod passthrough;
pub mod rewrite;
pub mod routes;
pub mod server;
pub mod upstream;

pub use error::{Error, Result};
pub use kubeconfig::Kubeconfig;
pub use logging::{RequestLog, RequestLogEntry, TracingRequestLog};
pub use rewrite::{
    RecomputeTableAge, RestoreOriginalMetadata, RewriteChain, RewriteRule, StripManagedFields,
};
pub use routes::{ProxyRoute, RouteStrategy, RouteTable};
pub use server::{serve, EmulationProxy, ServerConfig};
pub use upstream::{ReqwestUpstreamClient, UpstreamClient, UpstreamConfig};
