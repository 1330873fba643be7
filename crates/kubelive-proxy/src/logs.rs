//! Pod logs synthesized from the bundle
//!
//! The ephemeral API server has no kubelets, so log requests are answered
//! from the logs captured in the bundle and never forwarded upstream.

use axum::body::Body;
use axum::extract::Query;
use axum::http::{header, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use futures::stream;
use kubelive_common::{Bundle, LogKey};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::routes::PathParams;

/// Chunk size of streamed log bodies
const LOG_CHUNK_SIZE: usize = 64 * 1024;

/// Longest name Kubernetes accepts for namespaces, pods and containers
const MAX_NAME_LEN: usize = 253;

/// Query parameters of the pod log endpoint
///
/// `follow`, `timestamps` and `sinceSeconds` are accepted for compatibility;
/// bundle logs are finite and already rendered, so they have no effect.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOptions {
    /// Container to read; defaults to the pod's only container
    #[serde(default)]
    pub container: Option<String>,
    /// Read the previous container instance
    #[serde(default)]
    pub previous: bool,
    /// Only the last N lines
    #[serde(default)]
    pub tail_lines: Option<i64>,
    /// At most N bytes
    #[serde(default)]
    pub limit_bytes: Option<i64>,
    /// Ignored
    #[serde(default)]
    pub follow: bool,
    /// Ignored
    #[serde(default)]
    pub timestamps: bool,
    /// Ignored
    #[serde(default)]
    pub since_seconds: Option<i64>,
}

/// Serve `GET .../namespaces/{namespace}/pods/{pod}/log` from the bundle
pub fn serve_pod_logs(bundle: &dyn Bundle, params: &PathParams, uri: &Uri) -> Result<Response> {
    let namespace = path_param(params, "namespace")?;
    let pod = path_param(params, "pod")?;

    let Query(options) = Query::<LogOptions>::try_from_uri(uri)
        .map_err(|e| Error::BadRequest(format!("invalid log options: {}", e)))?;

    let tail_lines = match options.tail_lines {
        Some(n) if n < 0 => {
            return Err(Error::BadRequest(format!(
                "tailLines must be non-negative, got {}",
                n
            )))
        }
        n => n.map(|n| n as usize),
    };
    let limit_bytes = match options.limit_bytes {
        Some(n) if n < 1 => {
            return Err(Error::BadRequest(format!(
                "limitBytes must be positive, got {}",
                n
            )))
        }
        n => n.map(|n| n as usize),
    };

    let container = match options.container.as_deref().filter(|c| !c.is_empty()) {
        Some(container) => {
            validate_name("container", container)?;
            container.to_string()
        }
        None => default_container(bundle, namespace, pod)?,
    };

    let key = LogKey::new(namespace, pod, container).previous(options.previous);
    let logs = bundle.lookup_logs(&key).ok_or_else(|| {
        Error::NotFound(format!(
            "no logs in bundle for container \"{}\" in pod \"{}\" (namespace \"{}\"{})",
            key.container,
            key.pod,
            key.namespace,
            if key.previous { ", previous" } else { "" }
        ))
    })?;

    let mut logs = logs;
    if let Some(n) = tail_lines {
        logs = tail(logs, n);
    }
    if let Some(limit) = limit_bytes {
        logs = logs.slice(..logs.len().min(limit));
    }

    debug!(logs = %key, bytes = logs.len(), "Serving logs from bundle");
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from_stream(stream::iter(
            chunks(logs).map(Ok::<_, std::io::Error>),
        )))
        .map_err(|e| Error::Internal(format!("Failed to build log response: {}", e)))
}

fn path_param<'a>(params: &'a PathParams, name: &str) -> Result<&'a str> {
    let value = params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::BadRequest(format!("missing {} in path", name)))?;
    validate_name(name, value)?;
    Ok(value)
}

/// The pod's only container, or an error when there is no single choice
fn default_container(bundle: &dyn Bundle, namespace: &str, pod: &str) -> Result<String> {
    let mut containers = bundle.pod_containers(namespace, pod);
    match containers.len() {
        0 => Err(Error::NotFound(format!(
            "pods \"{}\" not found in namespace \"{}\"",
            pod, namespace
        ))),
        1 => Ok(containers.remove(0)),
        _ => Err(Error::BadRequest(format!(
            "a container name must be specified for pod {}, choose one of: [{}]",
            pod,
            containers.join(" ")
        ))),
    }
}

/// Accept names made of the characters Kubernetes object names may contain
fn validate_name(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));
    if valid {
        Ok(())
    } else {
        Err(Error::BadRequest(format!("invalid {} name {:?}", kind, name)))
    }
}

/// Last `n` lines of `logs`; a trailing newline does not start a new line
fn tail(logs: Bytes, n: usize) -> Bytes {
    if n == 0 {
        return Bytes::new();
    }
    let end = if logs.ends_with(b"\n") {
        logs.len() - 1
    } else {
        logs.len()
    };
    let mut seen = 0;
    for i in (0..end).rev() {
        if logs[i] == b'\n' {
            seen += 1;
            if seen == n {
                return logs.slice(i + 1..);
            }
        }
    }
    logs
}

fn chunks(logs: Bytes) -> impl Iterator<Item = Bytes> {
    (0..logs.len())
        .step_by(LOG_CHUNK_SIZE)
        .map(move |start| logs.slice(start..logs.len().min(start + LOG_CHUNK_SIZE)))
}
