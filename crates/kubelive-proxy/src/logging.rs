//! Per-request access logging
//!
//! Every request, synthesized or forwarded, produces exactly one
//! [`RequestLogEntry`] once the inner handler has produced its response.
//! Error responses are recorded with the status the client receives.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::info;

/// One handled request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestLogEntry {
    /// HTTP method
    pub method: Method,
    /// Full request URI including the query
    pub uri: String,
    /// Status sent to the client
    pub status: StatusCode,
    /// Time until the response head was ready
    pub latency: Duration,
}

/// Destination of request log entries
#[cfg_attr(test, mockall::automock)]
pub trait RequestLog: Send + Sync {
    /// Record one handled request
    fn record(&self, entry: &RequestLogEntry);
}

/// Emits one `info` event per request
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingRequestLog;

impl RequestLog for TracingRequestLog {
    fn record(&self, entry: &RequestLogEntry) {
        info!(
            method = %entry.method,
            uri = %entry.uri,
            status = entry.status.as_u16(),
            latency_ms = entry.latency.as_millis() as u64,
            "request"
        );
    }
}

/// Middleware recording every request to the configured [`RequestLog`]
///
/// Never alters the response.
pub async fn log_requests(
    State(log): State<Arc<dyn RequestLog>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    log.record(&RequestLogEntry {
        method,
        uri,
        status: response.status(),
        latency: started.elapsed(),
    });
    response
}
