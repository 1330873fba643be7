//! Error types for control plane provisioning
//!
//! Every variant except [`Error::Network`] is permanent for the current run.
//! Cache problems heal on the next run because an invalid entry is detected
//! and fetched again.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for provisioning operations
pub type Result<T> = std::result::Result<T, Error>;

/// Provisioning error
#[derive(Debug, Error)]
pub enum Error {
    /// The bundle version is missing or cannot be parsed
    #[error("failed to detect kubernetes version of bundle {bundle}: {message}")]
    VersionDetection {
        /// Bundle identifier
        bundle: String,
        /// What went wrong
        message: String,
    },

    /// Local setup is inconsistent
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },

    /// Filesystem failure while writing to the cache
    #[error("failed to write asset at {path}: {source}")]
    AssetWrite {
        /// Path being written
        path: PathBuf,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// A cache entry or archive does not contain a usable binary set
    #[error("invalid asset at {path}: {message}")]
    AssetValidation {
        /// Path that failed validation
        path: PathBuf,
        /// Why it is invalid
        message: String,
    },

    /// No matching binary set is published upstream
    #[error("no control plane binaries published for {spec} on {platform}")]
    VersionNotFound {
        /// Requested version selector
        spec: String,
        /// Requested platform
        platform: String,
    },

    /// A fetch was needed but network access is disabled
    #[error("network access is disabled and {spec} ({platform}) is not cached")]
    NetworkDisabled {
        /// Requested version selector
        spec: String,
        /// Requested platform
        platform: String,
    },

    /// Transient network failure
    #[error("network error: {message}")]
    Network {
        /// What failed
        message: String,
    },

    /// Upstream repository returned something unusable
    #[error("remote repository error: {message}")]
    Remote {
        /// What was wrong with the response
        message: String,
    },

    /// Downloaded archive does not match the published checksum
    #[error("checksum mismatch for {archive}: expected {expected}, got {actual}")]
    Checksum {
        /// Archive name
        archive: String,
        /// Published digest
        expected: String,
        /// Computed digest
        actual: String,
    },

    /// Provisioning was cancelled before completion
    #[error("provisioning cancelled")]
    Cancelled,

    /// Provisioning failed; names the selector and platform that could not be satisfied
    #[error("failed to provision control plane binaries for {spec} ({platform}): {source}")]
    Provisioning {
        /// Requested version selector
        spec: String,
        /// Requested platform
        platform: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a remote repository error
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// Create an asset write error
    pub fn asset_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::AssetWrite {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the failed operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_retryable() {
        assert!(Error::network("connection reset").is_retryable());
        assert!(!Error::configuration("bad").is_retryable());
        assert!(!Error::VersionNotFound {
            spec: "1.99.x".into(),
            platform: "linux/amd64".into(),
        }
        .is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn test_provisioning_error_names_spec_and_platform() {
        let err = Error::Provisioning {
            spec: "1.27.x".into(),
            platform: "linux/arm64".into(),
            source: Box::new(Error::network("timed out")),
        };
        let message = err.to_string();
        assert!(message.contains("1.27.x"));
        assert!(message.contains("linux/arm64"));
        assert!(message.contains("timed out"));
    }
}
