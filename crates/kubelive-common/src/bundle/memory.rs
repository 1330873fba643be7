//! In-memory bundle
//!
//! Built programmatically; used when embedding kubelive and throughout the
//! test suites of the other crates.

use std::collections::BTreeMap;

use bytes::Bytes;

use super::{Bundle, BundleError, LogKey};

/// A bundle whose contents live entirely in memory
#[derive(Clone, Debug, Default)]
pub struct MemoryBundle {
    id: String,
    version: Option<String>,
    logs: BTreeMap<LogKey, Bytes>,
}

impl MemoryBundle {
    /// Create an empty bundle with the given identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Record the cluster version string
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Record log content for a container
    pub fn with_logs(mut self, key: LogKey, content: impl Into<Bytes>) -> Self {
        self.logs.insert(key, content.into());
        self
    }
}

impl Bundle for MemoryBundle {
    fn id(&self) -> &str {
        &self.id
    }

    fn detect_version(&self) -> Result<String, BundleError> {
        self.version
            .clone()
            .ok_or_else(|| BundleError::VersionMissing {
                bundle: self.id.clone(),
            })
    }

    fn lookup_logs(&self, key: &LogKey) -> Option<Bytes> {
        self.logs.get(key).cloned()
    }

    fn pod_containers(&self, namespace: &str, pod: &str) -> Vec<String> {
        // BTreeMap iteration keeps containers sorted
        self.logs
            .keys()
            .filter(|k| k.namespace == namespace && k.pod == pod && !k.previous)
            .map(|k| k.container.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_bundle_lookup() {
        let bundle = MemoryBundle::new("mem")
            .with_version("v1.28.0")
            .with_logs(LogKey::new("ns", "pod", "b"), "bee")
            .with_logs(LogKey::new("ns", "pod", "a"), "ay")
            .with_logs(LogKey::new("ns", "pod", "a").previous(true), "old");

        assert_eq!(bundle.detect_version().unwrap(), "v1.28.0");
        assert_eq!(
            bundle.lookup_logs(&LogKey::new("ns", "pod", "a")).unwrap(),
            Bytes::from_static(b"ay")
        );
        assert_eq!(bundle.pod_containers("ns", "pod"), vec!["a", "b"]);
        assert!(bundle.pod_containers("ns", "other").is_empty());
    }

    #[test]
    fn test_memory_bundle_without_version() {
        let bundle = MemoryBundle::new("empty");
        assert!(matches!(
            bundle.detect_version(),
            Err(BundleError::VersionMissing { bundle }) if bundle == "empty"
        ));
    }
}
