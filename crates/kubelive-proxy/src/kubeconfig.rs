//! Reading the kubeconfig of the ephemeral API server
//!
//! Only the fields needed to reach one API server are modelled: the current
//! context's cluster (server, CA, TLS verification) and user (bearer token
//! or client certificate). Credentials may be inline (`*-data`, base64) or
//! file references, which resolve relative to the kubeconfig's directory.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Kubeconfig structure
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// Clusters
    #[serde(default)]
    pub clusters: Vec<KubeconfigCluster>,
    /// Users
    #[serde(default)]
    pub users: Vec<KubeconfigUser>,
    /// Contexts
    #[serde(default)]
    pub contexts: Vec<KubeconfigContext>,
    /// Current context
    #[serde(default)]
    pub current_context: Option<String>,
}

/// Cluster entry in kubeconfig
#[derive(Debug, Deserialize)]
pub struct KubeconfigCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate file
    #[serde(default)]
    pub certificate_authority: Option<PathBuf>,
    /// CA certificate (base64 encoded)
    #[serde(default)]
    pub certificate_authority_data: Option<String>,
    /// Skip server certificate verification
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

/// User entry in kubeconfig
#[derive(Debug, Deserialize)]
pub struct KubeconfigUser {
    /// User name
    pub name: String,
    /// User config
    #[serde(default)]
    pub user: UserConfig,
}

/// User configuration
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    /// Bearer token
    #[serde(default)]
    pub token: Option<String>,
    /// File containing a bearer token
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    /// Client certificate file
    #[serde(default)]
    pub client_certificate: Option<PathBuf>,
    /// Client certificate (base64 encoded)
    #[serde(default)]
    pub client_certificate_data: Option<String>,
    /// Client key file
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    /// Client key (base64 encoded)
    #[serde(default)]
    pub client_key_data: Option<String>,
}

/// Context entry in kubeconfig
#[derive(Debug, Deserialize)]
pub struct KubeconfigContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Deserialize)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    #[serde(default)]
    pub user: Option<String>,
}

/// Credentials of the selected context, decoded
#[derive(Default)]
pub(crate) struct ResolvedCredentials {
    pub server: String,
    pub ca_cert_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
    pub bearer_token: Option<Zeroizing<String>>,
    pub client_cert_pem: Option<Vec<u8>>,
    pub client_key_pem: Option<Zeroizing<Vec<u8>>>,
}

impl Kubeconfig {
    /// Parse a kubeconfig document
    pub fn parse(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(format!("invalid kubeconfig: {}", e)))
    }

    /// Read and parse a kubeconfig file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read kubeconfig {}: {}", path.display(), e))
        })?;
        Self::parse(&contents)
    }

    /// Context to use: `current-context`, or the only context when unset
    fn context(&self) -> Result<&ContextConfig> {
        let context = match &self.current_context {
            Some(name) if !name.is_empty() => self
                .contexts
                .iter()
                .find(|c| &c.name == name)
                .ok_or_else(|| Error::Config(format!("context '{}' not found", name)))?,
            _ => match self.contexts.as_slice() {
                [only] => only,
                [] => return Err(Error::Config("kubeconfig has no contexts".into())),
                _ => {
                    return Err(Error::Config(
                        "kubeconfig has several contexts but no current-context".into(),
                    ))
                }
            },
        };
        Ok(&context.context)
    }

    /// Decode the current context's cluster and user
    ///
    /// Relative file references resolve against `base_dir`.
    pub(crate) fn resolve(&self, base_dir: &Path) -> Result<ResolvedCredentials> {
        let context = self.context()?;
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| Error::Config(format!("cluster '{}' not found", context.cluster)))?;

        if cluster.server.is_empty() {
            return Err(Error::Config(format!(
                "cluster '{}' has no server",
                context.cluster
            )));
        }

        let user = match &context.user {
            Some(name) if !name.is_empty() => Some(
                self.users
                    .iter()
                    .find(|u| &u.name == name)
                    .map(|u| &u.user)
                    .ok_or_else(|| Error::Config(format!("user '{}' not found", name)))?,
            ),
            _ => None,
        };

        let mut resolved = ResolvedCredentials {
            server: cluster.server.clone(),
            ca_cert_pem: read_material(
                cluster.certificate_authority_data.as_deref(),
                cluster.certificate_authority.as_deref(),
                base_dir,
                "certificate-authority",
            )?,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
            ..Default::default()
        };

        if let Some(user) = user {
            resolved.bearer_token = match (&user.token, &user.token_file) {
                (Some(token), _) => Some(Zeroizing::new(token.trim().to_string())),
                (None, Some(file)) => {
                    let path = base_dir.join(file);
                    let token = std::fs::read_to_string(&path).map_err(|e| {
                        Error::Config(format!("failed to read token file {}: {}", path.display(), e))
                    })?;
                    Some(Zeroizing::new(token.trim().to_string()))
                }
                (None, None) => None,
            };
            resolved.client_cert_pem = read_material(
                user.client_certificate_data.as_deref(),
                user.client_certificate.as_deref(),
                base_dir,
                "client-certificate",
            )?;
            resolved.client_key_pem = read_material(
                user.client_key_data.as_deref(),
                user.client_key.as_deref(),
                base_dir,
                "client-key",
            )?
            .map(Zeroizing::new);
        }

        if resolved.client_cert_pem.is_some() != resolved.client_key_pem.is_some() {
            return Err(Error::Config(
                "client certificate and client key must be set together".into(),
            ));
        }

        Ok(resolved)
    }
}

/// Inline base64 data wins over a file reference
fn read_material(
    data: Option<&str>,
    file: Option<&Path>,
    base_dir: &Path,
    field: &str,
) -> Result<Option<Vec<u8>>> {
    if let Some(data) = data.filter(|d| !d.trim().is_empty()) {
        let decoded = STANDARD
            .decode(data.trim())
            .map_err(|e| Error::Config(format!("invalid base64 in {}-data: {}", field, e)))?;
        return Ok(Some(decoded));
    }
    match file {
        Some(file) => {
            let path = base_dir.join(file);
            std::fs::read(&path).map(Some).map_err(|e| {
                Error::Config(format!("failed to read {} {}: {}", field, path.display(), e))
            })
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: envtest
clusters:
- name: envtest
  cluster:
    server: https://127.0.0.1:6443
    certificate-authority-data: Q0EtUEVN
contexts:
- name: envtest
  context:
    cluster: envtest
    user: admin
- name: other
  context:
    cluster: missing
users:
- name: admin
  user:
    token: "  secret-token\n"
"#;

    #[test]
    fn test_resolve_inline_credentials() {
        let config = Kubeconfig::parse(KUBECONFIG).unwrap();
        let resolved = config.resolve(Path::new("/nonexistent")).unwrap();

        assert_eq!(resolved.server, "https://127.0.0.1:6443");
        assert_eq!(resolved.ca_cert_pem.as_deref(), Some(&b"CA-PEM"[..]));
        assert_eq!(
            resolved.bearer_token.as_ref().map(|t| t.as_str()),
            Some("secret-token")
        );
        assert!(!resolved.insecure_skip_tls_verify);
        assert!(resolved.client_cert_pem.is_none());
    }

    #[test]
    fn test_resolve_file_references_relative_to_base_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ca.crt"), "ca").unwrap();
        std::fs::write(dir.path().join("client.crt"), "cert").unwrap();
        std::fs::write(dir.path().join("client.key"), "key").unwrap();

        let config = Kubeconfig::parse(
            r#"
clusters:
- name: c
  cluster:
    server: https://localhost:6443
    certificate-authority: ca.crt
contexts:
- name: only
  context:
    cluster: c
    user: u
users:
- name: u
  user:
    client-certificate: client.crt
    client-key: client.key
"#,
        )
        .unwrap();

        let resolved = config.resolve(dir.path()).unwrap();
        assert_eq!(resolved.ca_cert_pem.as_deref(), Some(&b"ca"[..]));
        assert_eq!(resolved.client_cert_pem.as_deref(), Some(&b"cert"[..]));
        assert_eq!(
            resolved.client_key_pem.as_ref().map(|k| k.as_slice()),
            Some(&b"key"[..])
        );
        assert!(resolved.bearer_token.is_none());
    }

    #[test]
    fn test_missing_cluster_reference() {
        let mut config = Kubeconfig::parse(KUBECONFIG).unwrap();
        config.current_context = Some("other".into());
        assert!(matches!(
            config.resolve(Path::new(".")),
            Err(Error::Config(msg)) if msg.contains("missing")
        ));
    }

    #[test]
    fn test_ambiguous_context() {
        let mut config = Kubeconfig::parse(KUBECONFIG).unwrap();
        config.current_context = None;
        assert!(config.resolve(Path::new(".")).is_err());
    }

    #[test]
    fn test_key_without_certificate_is_rejected() {
        let config = Kubeconfig::parse(
            r#"
clusters:
- name: c
  cluster:
    server: https://localhost:6443
contexts:
- name: only
  context:
    cluster: c
    user: u
users:
- name: u
  user:
    client-key-data: a2V5
"#,
        )
        .unwrap();
        assert!(config.resolve(Path::new(".")).is_err());
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            Kubeconfig::parse("clusters: [unterminated"),
            Err(Error::Config(_))
        ));
    }
}
