//! Connection to the ephemeral API server
//!
//! Passthrough requests go through the [`UpstreamClient`] trait so tests can
//! inject a mock instead of a running API server. Dropping a pending request
//! future aborts the upstream call, so a client that disconnects does not
//! leave an abandoned request behind.

use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures::TryStreamExt;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::kubeconfig::Kubeconfig;

/// Default timeout for non-streaming upstream requests (30 seconds)
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream of response body chunks
pub type ByteStream = Pin<Box<dyn futures::Stream<Item = std::io::Result<Bytes>> + Send>>;

/// How to reach and authenticate to the upstream API server
#[derive(Clone)]
pub struct UpstreamConfig {
    /// API server base URL
    pub server: String,
    /// CA bundle used to verify the server
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Client certificate
    pub client_cert_pem: Option<Vec<u8>>,
    /// Client key (zeroized on drop)
    pub client_key_pem: Option<Zeroizing<Vec<u8>>>,
    /// Bearer token (zeroized on drop)
    pub bearer_token: Option<Zeroizing<String>>,
    /// Skip server certificate verification
    pub insecure_skip_tls_verify: bool,
    /// Timeout for non-streaming requests
    pub timeout: Duration,
}

impl UpstreamConfig {
    /// Unauthenticated connection to `server`
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ca_cert_pem: None,
            client_cert_pem: None,
            client_key_pem: None,
            bearer_token: None,
            insecure_skip_tls_verify: false,
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    /// Read the current context of the kubeconfig at `path`
    pub fn from_kubeconfig(path: &Path) -> Result<Self> {
        let kubeconfig = Kubeconfig::load(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_parsed(&kubeconfig, base_dir)
    }

    /// Use an already parsed kubeconfig; file references resolve against `base_dir`
    pub fn from_parsed(kubeconfig: &Kubeconfig, base_dir: &Path) -> Result<Self> {
        let resolved = kubeconfig.resolve(base_dir)?;
        Ok(Self {
            server: resolved.server,
            ca_cert_pem: resolved.ca_cert_pem,
            client_cert_pem: resolved.client_cert_pem,
            client_key_pem: resolved.client_key_pem,
            bearer_token: resolved.bearer_token,
            insecure_skip_tls_verify: resolved.insecure_skip_tls_verify,
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        })
    }
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("server", &self.server)
            .field("ca_cert_pem", &self.ca_cert_pem.is_some())
            .field("client_cert_pem", &self.client_cert_pem.is_some())
            .field("client_key_pem", &self.client_key_pem.as_ref().map(|_| "<redacted>"))
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Request forwarded to the upstream API server
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    /// HTTP method
    pub method: Method,
    /// Path plus query string, e.g. `/api/v1/pods?limit=500`
    pub path_and_query: String,
    /// Sanitized request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
}

/// Buffered upstream response
#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

/// Streaming upstream response for watch queries
pub struct StreamingUpstreamResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Stream of response chunks
    pub stream: ByteStream,
}

/// Trait for making HTTP requests to the upstream API server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Make a non-streaming HTTP request
    async fn request(&self, req: UpstreamRequest) -> Result<UpstreamResponse>;

    /// Make a streaming HTTP request (for watch queries)
    async fn request_streaming(&self, req: UpstreamRequest) -> Result<StreamingUpstreamResponse>;
}

/// Default [`UpstreamClient`] using reqwest
pub struct ReqwestUpstreamClient {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<Zeroizing<String>>,
    timeout: Duration,
}

impl ReqwestUpstreamClient {
    /// Build a client from connection settings
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);

        if let Some(ca) = &config.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(ca)
                .map_err(|e| Error::Config(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(cert), Some(key)) = (&config.client_cert_pem, &config.client_key_pem) {
            let mut pem = Zeroizing::new(cert.clone());
            pem.push(b'\n');
            pem.extend_from_slice(key);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| Error::Config(format!("invalid client certificate: {}", e)))?;
            builder = builder.identity(identity);
        }

        if config.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.server.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
            timeout: config.timeout,
        })
    }

    /// Build a reqwest request from an UpstreamRequest
    fn build_request(&self, req: UpstreamRequest) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, req.path_and_query);
        let mut builder = self.client.request(req.method, url).headers(req.headers);

        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token.as_str());
        }

        if !req.body.is_empty() {
            builder = builder.body(req.body);
        }

        builder
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    async fn request(&self, req: UpstreamRequest) -> Result<UpstreamResponse> {
        debug!(method = %req.method, path = %req.path_and_query, "Forwarding to upstream");
        let response = self
            .build_request(req)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("failed to read response: {}", e)))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    async fn request_streaming(&self, req: UpstreamRequest) -> Result<StreamingUpstreamResponse> {
        debug!(method = %req.method, path = %req.path_and_query, "Streaming from upstream");
        let response = self
            .build_request(req)
            .send()
            .await
            .map_err(|e| Error::UpstreamUnavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        let headers = response.headers().clone();
        let stream = response.bytes_stream().map_err(std::io::Error::other);

        Ok(StreamingUpstreamResponse {
            status,
            headers,
            stream: Box::pin(stream),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_kubeconfig_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kubeconfig");
        std::fs::write(dir.path().join("token"), "file-token\n").unwrap();
        std::fs::write(
            &path,
            r#"
current-context: envtest
clusters:
- name: envtest
  cluster:
    server: http://127.0.0.1:45321/
    insecure-skip-tls-verify: true
contexts:
- name: envtest
  context:
    cluster: envtest
    user: envtest
users:
- name: envtest
  user:
    token-file: token
"#,
        )
        .unwrap();

        let config = UpstreamConfig::from_kubeconfig(&path).unwrap();
        assert_eq!(config.server, "http://127.0.0.1:45321/");
        assert!(config.insecure_skip_tls_verify);
        assert_eq!(
            config.bearer_token.as_ref().map(|t| t.as_str()),
            Some("file-token")
        );
        assert_eq!(config.timeout, DEFAULT_UPSTREAM_TIMEOUT);
    }

    #[test]
    fn test_from_kubeconfig_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            UpstreamConfig::from_kubeconfig(&dir.path().join("absent")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = UpstreamConfig::new("https://127.0.0.1:6443");
        config.bearer_token = Some(Zeroizing::new("super-secret".to_string()));
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = ReqwestUpstreamClient::new(&UpstreamConfig::new("http://127.0.0.1:8001/")).unwrap();
        assert_eq!(client.base_url, "http://127.0.0.1:8001");
    }
}
