//! Captured cluster snapshot access
//!
//! A bundle is immutable for the lifetime of the process. The version
//! resolver and the emulation proxy both hold a shared, read-only handle
//! (`Arc<dyn Bundle>`) and never copy its contents.

mod directory;
mod memory;

use bytes::Bytes;

pub use directory::DirectoryBundle;
pub use memory::MemoryBundle;

/// Errors raised while reading bundle contents
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// The bundle does not record the cluster version
    #[error("bundle {bundle} does not contain cluster version information")]
    VersionMissing {
        /// Bundle identifier
        bundle: String,
    },

    /// The recorded version document could not be decoded
    #[error("bundle {bundle} has malformed version information: {message}")]
    VersionMalformed {
        /// Bundle identifier
        bundle: String,
        /// What was wrong with the document
        message: String,
    },

    /// Filesystem error while reading the bundle
    #[error("failed to read bundle {bundle}: {source}")]
    Io {
        /// Bundle identifier
        bundle: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },
}

/// Identifies one container log stream inside a bundle
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogKey {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name
    pub container: String,
    /// Whether the log of the previous container instance is requested
    pub previous: bool,
}

impl LogKey {
    /// Key for the current log of a container
    pub fn new(
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
            previous: false,
        }
    }

    /// Switch the key to the previous container instance
    pub fn previous(mut self, previous: bool) -> Self {
        self.previous = previous;
        self
    }
}

impl std::fmt::Display for LogKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.pod, self.container)?;
        if self.previous {
            write!(f, " (previous)")?;
        }
        Ok(())
    }
}

/// Read-only view of a captured cluster snapshot
///
/// All operations are synchronous and bounded by local IO. Implementations
/// must be safe to share across concurrently handled requests.
pub trait Bundle: Send + Sync {
    /// Stable identifier used in diagnostics (typically the bundle path)
    fn id(&self) -> &str;

    /// Raw Kubernetes server version string the snapshot was captured from
    fn detect_version(&self) -> Result<String, BundleError>;

    /// Stored log content for a container, `None` when the bundle has none
    fn lookup_logs(&self, key: &LogKey) -> Option<Bytes>;

    /// Containers with stored (current) logs for a pod, sorted by name
    fn pod_containers(&self, namespace: &str, pod: &str) -> Vec<String>;
}
