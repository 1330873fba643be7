//! Forwarding to the ephemeral API server
//!
//! Requests are forwarded with the proxy's own upstream credentials; any
//! credentials or impersonation headers sent by the client are dropped.
//! Responses go through the [`RewriteChain`] before they reach the client.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request};
use axum::response::Response;
use tracing::debug;

use crate::error::{Error, Result};
use crate::rewrite::{is_json, rewrite_watch_stream, RewriteChain};
use crate::upstream::{UpstreamClient, UpstreamRequest};

/// Maximum request body size (10 MB - reasonable for K8s API)
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Protobuf media type clients may ask for
const PROTOBUF_MEDIA_TYPE: &str = "application/vnd.kubernetes.protobuf";

/// Headers that only apply to a single connection
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forward a request upstream and rewrite the response
pub async fn forward(
    client: &dyn UpstreamClient,
    rewrite: &Arc<RewriteChain>,
    request: Request<Body>,
) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let body = axum::body::to_bytes(body, MAX_BODY_SIZE)
        .await
        .map_err(|e| Error::BadRequest(format!("Failed to read request body: {}", e)))?;

    let upstream_request = UpstreamRequest {
        method: parts.method,
        path_and_query,
        headers: prefer_json(sanitize_request_headers(&parts.headers)),
        body,
    };

    if is_watch_query(parts.uri.query()) || is_watch_path(parts.uri.path()) {
        debug!(path = %upstream_request.path_and_query, "Proxying watch");
        let streaming = client.request_streaming(upstream_request).await?;
        let content_type = content_type(&streaming.headers);
        let stream = if is_json(content_type.as_deref()) {
            rewrite_watch_stream(rewrite.clone(), streaming.stream)
        } else {
            streaming.stream
        };

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = streaming.status;
        *response.headers_mut() = sanitize_response_headers(&streaming.headers);
        return Ok(response);
    }

    let upstream = client.request(upstream_request).await?;
    debug!(
        status = upstream.status.as_u16(),
        body_len = upstream.body.len(),
        "Received response from upstream"
    );

    let content_type = content_type(&upstream.headers);
    let body = rewrite.rewrite_body(content_type.as_deref(), upstream.body);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = sanitize_response_headers(&upstream.headers);
    Ok(response)
}

/// Whether the query asks for a watch stream
pub(crate) fn is_watch_query(query: Option<&str>) -> bool {
    query.is_some_and(|q| {
        q.split('&')
            .any(|pair| pair == "watch=true" || pair == "watch=1")
    })
}

/// Whether the path uses the legacy watch form, where `watch` follows the
/// group version: `/api/v1/watch/...` or `/apis/<group>/<version>/watch/...`
pub(crate) fn is_watch_path(path: &str) -> bool {
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    let watch_at = match segments.first() {
        Some(&"api") => 2,
        Some(&"apis") => 3,
        _ => return false,
    };
    segments.get(watch_at) == Some(&"watch")
        && segments.get(watch_at + 1).is_some_and(|s| !s.is_empty())
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Drop client credentials, impersonation and per-connection headers
pub(crate) fn sanitize_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut sanitized = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str();
        if is_hop_by_hop(name)
            || lower.starts_with("impersonate-")
            || *name == header::AUTHORIZATION
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || *name == header::ACCEPT_ENCODING
        {
            continue;
        }
        sanitized.append(name.clone(), value.clone());
    }
    sanitized
}

/// Response headers that still hold after the body may have been rewritten
pub(crate) fn sanitize_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut sanitized = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name) || *name == header::CONTENT_LENGTH {
            continue;
        }
        sanitized.append(name.clone(), value.clone());
    }
    sanitized
}

/// Replace protobuf in `Accept` with JSON so responses can be rewritten
pub(crate) fn prefer_json(mut headers: HeaderMap) -> HeaderMap {
    let Some(accept) = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return headers;
    };
    if !accept.contains(PROTOBUF_MEDIA_TYPE) {
        return headers;
    }

    let kept: Vec<&str> = accept
        .split(',')
        .map(str::trim)
        .filter(|media| !media.starts_with(PROTOBUF_MEDIA_TYPE))
        .collect();
    let replacement = if kept.is_empty() {
        "application/json".to_string()
    } else {
        kept.join(",")
    };

    if let Ok(value) = HeaderValue::from_str(&replacement) {
        headers.insert(header::ACCEPT, value);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_is_watch_query() {
        assert!(is_watch_query(Some("watch=true")));
        assert!(is_watch_query(Some("labelSelector=app%3Dweb&watch=1")));
        assert!(!is_watch_query(Some("watch=false")));
        assert!(!is_watch_query(Some("allowWatchBookmarks=true")));
        assert!(!is_watch_query(Some("fieldSelector=watch=true2")));
        assert!(!is_watch_query(None));
    }

    #[test]
    fn test_is_watch_path() {
        assert!(is_watch_path("/api/v1/watch/pods"));
        assert!(is_watch_path("/api/v1/watch/namespaces/default/pods/web-0"));
        assert!(is_watch_path("/apis/apps/v1/watch/namespaces/default/deployments"));
        assert!(!is_watch_path("/api/v1/pods"));
        assert!(!is_watch_path("/api/v1/watch"));
        assert!(!is_watch_path("/api/v1/namespaces/watch/pods"));
        assert!(!is_watch_path("/apis/watch/v1/things"));
        assert!(!is_watch_path("/apis/apps/watch/deployments"));
        assert!(!is_watch_path("/healthz"));
    }

    #[test]
    fn test_sanitize_request_headers() {
        let sanitized = sanitize_request_headers(&headers(&[
            ("authorization", "Bearer client-token"),
            ("impersonate-user", "admin"),
            ("impersonate-group", "system:masters"),
            ("impersonate-extra-scopes", "all"),
            ("connection", "keep-alive"),
            ("host", "localhost:8080"),
            ("accept-encoding", "gzip"),
            ("content-type", "application/json"),
            ("user-agent", "kubectl/v1.27.3"),
        ]));

        assert_eq!(sanitized.len(), 2);
        assert_eq!(sanitized["content-type"], "application/json");
        assert_eq!(sanitized["user-agent"], "kubectl/v1.27.3");
    }

    #[test]
    fn test_sanitize_response_headers() {
        let sanitized = sanitize_response_headers(&headers(&[
            ("content-length", "1234"),
            ("transfer-encoding", "chunked"),
            ("content-type", "application/json"),
            ("audit-id", "abc"),
        ]));
        assert_eq!(sanitized.len(), 2);
        assert!(sanitized.get("content-length").is_none());
        assert_eq!(sanitized["audit-id"], "abc");
    }

    #[test]
    fn test_prefer_json() {
        let rewritten = prefer_json(headers(&[(
            "accept",
            "application/vnd.kubernetes.protobuf, application/json",
        )]));
        assert_eq!(rewritten["accept"], "application/json");

        let rewritten = prefer_json(headers(&[("accept", "application/vnd.kubernetes.protobuf")]));
        assert_eq!(rewritten["accept"], "application/json");

        let table = "application/json;as=Table;v=v1;g=meta.k8s.io,application/json";
        let untouched = prefer_json(headers(&[("accept", table)]));
        assert_eq!(untouched["accept"], table);

        assert!(prefer_json(HeaderMap::new()).get("accept").is_none());
    }
}
