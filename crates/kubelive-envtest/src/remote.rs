//! Remote repository of control plane binary archives
//!
//! Releases are published by controller-tools as `envtest-vX.Y.Z-os-arch.tar.gz`
//! and listed in a YAML index:
//!
//! ```yaml
//! releases:
//!   v1.27.1:
//!     envtest-v1.27.1-linux-amd64.tar.gz:
//!       hash: <sha512 hex>
//!       selfLink: https://github.com/.../envtest-v1.27.1-linux-amd64.tar.gz
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use semver::Version;
use serde::Deserialize;
use sha2::{Digest, Sha512};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::platform::Platform;

/// Release index maintained by controller-tools
pub const DEFAULT_INDEX_URL: &str =
    "https://raw.githubusercontent.com/kubernetes-sigs/controller-tools/HEAD/envtest-releases.yaml";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const INDEX_TIMEOUT: Duration = Duration::from_secs(30);

/// One downloadable archive
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteArchive {
    /// Release version
    pub version: Version,
    /// Platform the archive is built for
    pub platform: Platform,
    /// Archive file name
    pub name: String,
    /// Download URL
    pub url: String,
    /// Published SHA-512 (lowercase hex), if any
    pub sha512: Option<String>,
}

/// Source of published archives
///
/// The seam between provisioning logic and the network; tests substitute a
/// mock so no real downloads happen.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// List every published archive
    async fn releases(&self) -> Result<Vec<RemoteArchive>>;

    /// Download `archive` to `dest`, returning the SHA-512 (lowercase hex) of
    /// the bytes written
    async fn download(&self, archive: &RemoteArchive, dest: &Path) -> Result<String>;
}

/// [`AssetSource`] backed by the public release index over HTTPS
#[derive(Clone, Debug)]
pub struct HttpAssetSource {
    client: reqwest::Client,
    index_url: String,
}

impl HttpAssetSource {
    /// Source reading [`DEFAULT_INDEX_URL`]
    pub fn new() -> Result<Self> {
        Self::with_index_url(DEFAULT_INDEX_URL)
    }

    /// Source reading a mirror of the release index
    pub fn with_index_url(index_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("kubelive/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            index_url: index_url.into(),
        })
    }

    /// Index URL this source reads
    pub fn index_url(&self) -> &str {
        &self.index_url
    }
}

#[async_trait]
impl AssetSource for HttpAssetSource {
    async fn releases(&self) -> Result<Vec<RemoteArchive>> {
        debug!(url = %self.index_url, "Fetching release index");
        let response = self
            .client
            .get(&self.index_url)
            .timeout(INDEX_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::network(format!("failed to fetch release index: {}", e)))?;

        if let Some(err) = classify_status(response.status(), "release index") {
            return Err(err);
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::network(format!("failed to read release index: {}", e)))?;
        parse_index(&body)
    }

    async fn download(&self, archive: &RemoteArchive, dest: &Path) -> Result<String> {
        info!(archive = %archive.name, url = %archive.url, "Downloading control plane binaries");
        let response = self
            .client
            .get(&archive.url)
            .send()
            .await
            .map_err(|e| Error::network(format!("failed to download {}: {}", archive.name, e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::VersionNotFound {
                spec: archive.version.to_string(),
                platform: archive.platform.to_string(),
            });
        }
        if let Some(err) = classify_status(response.status(), &archive.name) {
            return Err(err);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dest)
            .await
            .map_err(|e| Error::asset_write(dest, e))?;

        let mut hasher = Sha512::new();
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                Error::network(format!("download of {} interrupted: {}", archive.name, e))
            })?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::asset_write(dest, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| Error::asset_write(dest, e))?;
        file.sync_all()
            .await
            .map_err(|e| Error::asset_write(dest, e))?;

        debug!(archive = %archive.name, bytes = written, "Download complete");
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Map an unsuccessful HTTP status to an error; `None` for success
fn classify_status(status: StatusCode, what: &str) -> Option<Error> {
    if status.is_success() {
        return None;
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Some(Error::network(format!(
            "{} returned HTTP {}",
            what, status
        )));
    }
    Some(Error::remote(format!("{} returned HTTP {}", what, status)))
}

#[derive(Debug, Deserialize)]
struct ReleaseIndex {
    #[serde(default)]
    releases: BTreeMap<String, BTreeMap<String, IndexedArchive>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexedArchive {
    #[serde(default)]
    hash: Option<String>,
    self_link: String,
}

/// Parse the release index, skipping entries with unrecognized names
fn parse_index(body: &str) -> Result<Vec<RemoteArchive>> {
    let index: ReleaseIndex = serde_yaml::from_str(body)
        .map_err(|e| Error::remote(format!("malformed release index: {}", e)))?;

    let mut archives = Vec::new();
    for (release, files) in index.releases {
        let Ok(version) = Version::parse(release.trim_start_matches('v')) else {
            debug!(release = %release, "Skipping unparseable release");
            continue;
        };
        for (name, entry) in files {
            let Some(platform) = parse_archive_name(&name, &version) else {
                debug!(archive = %name, "Skipping unrecognized archive");
                continue;
            };
            archives.push(RemoteArchive {
                version: version.clone(),
                platform,
                name,
                url: entry.self_link,
                sha512: entry
                    .hash
                    .map(|h| h.trim().to_ascii_lowercase())
                    .filter(|h| !h.is_empty()),
            });
        }
    }
    Ok(archives)
}

/// Platform of `envtest-v<version>-<os>-<arch>.tar.gz`
fn parse_archive_name(name: &str, version: &Version) -> Option<Platform> {
    let stem = name.strip_prefix("envtest-")?.strip_suffix(".tar.gz")?;
    let mut parts = stem.rsplitn(3, '-');
    let arch = parts.next()?;
    let os = parts.next()?;
    let archive_version = parts.next()?;
    if archive_version.trim_start_matches('v') != version.to_string() {
        return None;
    }
    if os.is_empty() || arch.is_empty() {
        return None;
    }
    Some(Platform::new(os, arch))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"
releases:
  v1.27.1:
    envtest-v1.27.1-darwin-arm64.tar.gz:
      hash: ABCDEF
      selfLink: https://example.invalid/envtest-v1.27.1-darwin-arm64.tar.gz
    envtest-v1.27.1-linux-amd64.tar.gz:
      hash: 0123abcd
      selfLink: https://example.invalid/envtest-v1.27.1-linux-amd64.tar.gz
  v1.28.0-alpha.1:
    envtest-v1.28.0-alpha.1-linux-amd64.tar.gz:
      selfLink: https://example.invalid/envtest-v1.28.0-alpha.1-linux-amd64.tar.gz
  nightly:
    envtest-nightly-linux-amd64.tar.gz:
      selfLink: https://example.invalid/nightly.tar.gz
"#;

    #[test]
    fn test_parse_index() {
        let archives = parse_index(INDEX).unwrap();
        assert_eq!(archives.len(), 3);

        let linux = archives
            .iter()
            .find(|a| a.name == "envtest-v1.27.1-linux-amd64.tar.gz")
            .unwrap();
        assert_eq!(linux.version, Version::new(1, 27, 1));
        assert_eq!(linux.platform, Platform::new("linux", "amd64"));
        assert_eq!(linux.sha512.as_deref(), Some("0123abcd"));

        let darwin = archives
            .iter()
            .find(|a| a.platform.os == "darwin")
            .unwrap();
        assert_eq!(darwin.sha512.as_deref(), Some("abcdef"));

        let alpha = archives
            .iter()
            .find(|a| !a.version.pre.is_empty())
            .unwrap();
        assert_eq!(alpha.sha512, None);
    }

    #[test]
    fn test_parse_index_rejects_malformed_yaml() {
        assert!(matches!(
            parse_index("releases: [not, a, map"),
            Err(Error::Remote { .. })
        ));
    }

    #[test]
    fn test_parse_index_empty() {
        assert!(parse_index("releases: {}").unwrap().is_empty());
        assert!(parse_index("{}").unwrap().is_empty());
    }

    #[test]
    fn test_parse_archive_name() {
        let version = Version::new(1, 27, 1);
        assert_eq!(
            parse_archive_name("envtest-v1.27.1-linux-ppc64le.tar.gz", &version),
            Some(Platform::new("linux", "ppc64le"))
        );
        assert_eq!(
            parse_archive_name("envtest-v1.26.0-linux-amd64.tar.gz", &version),
            None
        );
        assert_eq!(
            parse_archive_name("envtest-v1.27.1-linux-amd64.zip", &version),
            None
        );
        assert_eq!(parse_archive_name("kubebuilder-tools.tar.gz", &version), None);
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK, "index").is_none());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "index")
            .unwrap()
            .is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "index")
            .unwrap()
            .is_retryable());
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "index"),
            Some(Error::Remote { .. })
        ));
    }

    #[test]
    fn test_http_source_uses_configured_index() {
        let source = HttpAssetSource::with_index_url("https://mirror.invalid/index.yaml").unwrap();
        assert_eq!(source.index_url(), "https://mirror.invalid/index.yaml");
        assert_eq!(HttpAssetSource::new().unwrap().index_url(), DEFAULT_INDEX_URL);
    }
}
