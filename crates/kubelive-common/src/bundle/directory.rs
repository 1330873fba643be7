//! Bundle backed by an extracted support-bundle directory
//!
//! Layout (relative to the bundle root):
//!
//! ```text
//! cluster-info/cluster_version.json
//! cluster-resources/pods/logs/<namespace>/<pod>/<container>.log
//! cluster-resources/pods/logs/<namespace>/<pod>/<container>-previous.log
//! ```

use std::path::{Path, PathBuf};

use bytes::Bytes;
use k8s_openapi::apimachinery::pkg::version::Info;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Bundle, BundleError, LogKey};

const CLUSTER_VERSION_FILE: &str = "cluster-info/cluster_version.json";
const POD_LOGS_DIR: &str = "cluster-resources/pods/logs";
const LOG_SUFFIX: &str = ".log";
const PREVIOUS_LOG_SUFFIX: &str = "-previous.log";

/// On-disk cluster version document
#[derive(Debug, Deserialize)]
struct ClusterVersion {
    /// Full version info as returned by the `/version` endpoint
    #[serde(default)]
    info: Option<serde_json::Value>,
    /// Preformatted version string (e.g. "v1.27.3")
    #[serde(default)]
    string: Option<String>,
}

impl ClusterVersion {
    fn git_version(&self) -> Option<String> {
        let info = self.info.as_ref()?;
        match serde_json::from_value::<Info>(info.clone()) {
            Ok(info) => Some(info.git_version),
            // Older collectors omit some of the required fields
            Err(_) => info
                .get("gitVersion")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }
}

/// A support bundle extracted to a local directory
#[derive(Clone, Debug)]
pub struct DirectoryBundle {
    id: String,
    root: PathBuf,
}

impl DirectoryBundle {
    /// Open a bundle rooted at `root`
    ///
    /// Fails if `root` is not a directory. Contents are read lazily.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BundleError> {
        let root = root.into();
        let id = root.display().to_string();
        let metadata = std::fs::metadata(&root).map_err(|source| BundleError::Io {
            bundle: id.clone(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(BundleError::Io {
                bundle: id,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "bundle path is not a directory",
                ),
            });
        }
        Ok(Self { id, root })
    }

    /// Bundle root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pod_logs_dir(&self, namespace: &str, pod: &str) -> Option<PathBuf> {
        if !is_safe_component(namespace) || !is_safe_component(pod) {
            return None;
        }
        Some(self.root.join(POD_LOGS_DIR).join(namespace).join(pod))
    }

    fn log_path(&self, key: &LogKey) -> Option<PathBuf> {
        if !is_safe_component(&key.container) {
            return None;
        }
        let suffix = if key.previous {
            PREVIOUS_LOG_SUFFIX
        } else {
            LOG_SUFFIX
        };
        let dir = self.pod_logs_dir(&key.namespace, &key.pod)?;
        Some(dir.join(format!("{}{}", key.container, suffix)))
    }
}

/// Reject anything that could escape the bundle root when joined
fn is_safe_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

impl Bundle for DirectoryBundle {
    fn id(&self) -> &str {
        &self.id
    }

    fn detect_version(&self) -> Result<String, BundleError> {
        let path = self.root.join(CLUSTER_VERSION_FILE);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BundleError::VersionMissing {
                    bundle: self.id.clone(),
                })
            }
            Err(source) => {
                return Err(BundleError::Io {
                    bundle: self.id.clone(),
                    source,
                })
            }
        };

        let doc: ClusterVersion =
            serde_json::from_slice(&data).map_err(|e| BundleError::VersionMalformed {
                bundle: self.id.clone(),
                message: e.to_string(),
            })?;

        doc.git_version()
            .or(doc.string)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| BundleError::VersionMissing {
                bundle: self.id.clone(),
            })
    }

    fn lookup_logs(&self, key: &LogKey) -> Option<Bytes> {
        let path = self.log_path(key)?;
        match std::fs::read(&path) {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key = %key, path = %path.display(), "No log file in bundle");
                None
            }
            Err(e) => {
                warn!(key = %key, path = %path.display(), error = %e, "Failed to read bundle log");
                None
            }
        }
    }

    fn pod_containers(&self, namespace: &str, pod: &str) -> Vec<String> {
        let Some(dir) = self.pod_logs_dir(namespace, pod) else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut containers: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.ends_with(PREVIOUS_LOG_SUFFIX))
            .filter_map(|name| name.strip_suffix(LOG_SUFFIX).map(str::to_string))
            .collect();
        containers.sort();
        containers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    fn bundle_with_version(doc: &str) -> (TempDir, DirectoryBundle) {
        let dir = TempDir::new().unwrap();
        write(dir.path(), CLUSTER_VERSION_FILE, doc);
        let bundle = DirectoryBundle::open(dir.path()).unwrap();
        (dir, bundle)
    }

    #[test]
    fn test_open_rejects_missing_directory() {
        let dir = TempDir::new().unwrap();
        let result = DirectoryBundle::open(dir.path().join("nope"));
        assert!(matches!(result, Err(BundleError::Io { .. })));
    }

    #[test]
    fn test_detect_version_from_info() {
        let (_dir, bundle) = bundle_with_version(
            r#"{"info":{"major":"1","minor":"27","gitVersion":"v1.27.3"},"string":"v1.27.2"}"#,
        );
        assert_eq!(bundle.detect_version().unwrap(), "v1.27.3");
    }

    #[test]
    fn test_detect_version_falls_back_to_string() {
        let (_dir, bundle) = bundle_with_version(r#"{"string":"v1.26.1"}"#);
        assert_eq!(bundle.detect_version().unwrap(), "v1.26.1");
    }

    #[test]
    fn test_detect_version_missing_file() {
        let dir = TempDir::new().unwrap();
        let bundle = DirectoryBundle::open(dir.path()).unwrap();
        assert!(matches!(
            bundle.detect_version(),
            Err(BundleError::VersionMissing { .. })
        ));
    }

    #[test]
    fn test_detect_version_malformed_json() {
        let (_dir, bundle) = bundle_with_version("{not json");
        assert!(matches!(
            bundle.detect_version(),
            Err(BundleError::VersionMalformed { .. })
        ));
    }

    #[test]
    fn test_detect_version_empty_document() {
        let (_dir, bundle) = bundle_with_version(r#"{"string":""}"#);
        assert!(matches!(
            bundle.detect_version(),
            Err(BundleError::VersionMissing { .. })
        ));
    }

    #[test]
    fn test_lookup_logs_current_and_previous() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "cluster-resources/pods/logs/default/web-0/app.log",
            "current\n",
        );
        write(
            dir.path(),
            "cluster-resources/pods/logs/default/web-0/app-previous.log",
            "crashed\n",
        );
        let bundle = DirectoryBundle::open(dir.path()).unwrap();

        let key = LogKey::new("default", "web-0", "app");
        assert_eq!(
            bundle.lookup_logs(&key).unwrap(),
            Bytes::from_static(b"current\n")
        );
        assert_eq!(
            bundle.lookup_logs(&key.previous(true)).unwrap(),
            Bytes::from_static(b"crashed\n")
        );
        assert!(bundle
            .lookup_logs(&LogKey::new("default", "web-0", "sidecar"))
            .is_none());
    }

    #[test]
    fn test_lookup_logs_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), CLUSTER_VERSION_FILE, "{}");
        let bundle = DirectoryBundle::open(dir.path()).unwrap();

        assert!(bundle
            .lookup_logs(&LogKey::new("..", "..", "cluster_version"))
            .is_none());
        assert!(bundle
            .lookup_logs(&LogKey::new("default", "web-0", "../../x"))
            .is_none());
    }

    #[test]
    fn test_pod_containers_skips_previous_logs() {
        let dir = TempDir::new().unwrap();
        for name in ["sidecar.log", "app.log", "app-previous.log", "notes.txt"] {
            write(
                dir.path(),
                &format!("cluster-resources/pods/logs/default/web-0/{}", name),
                "x",
            );
        }
        let bundle = DirectoryBundle::open(dir.path()).unwrap();

        assert_eq!(bundle.pod_containers("default", "web-0"), vec!["app", "sidecar"]);
        assert!(bundle.pod_containers("default", "missing").is_empty());
    }
}
