//! Selecting and downloading a binary archive

use std::path::Path;
use std::sync::Arc;

use kubelive_common::{retry_with_backoff_if, RetryConfig};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::remote::{AssetSource, RemoteArchive};
use crate::version::VersionSpec;

/// How the fetcher is allowed to behave
#[derive(Clone, Debug)]
pub struct FetchPolicy {
    /// Compare downloads against the published SHA-512
    pub verify_checksum: bool,
    /// Download even when a valid cache entry exists
    pub force_download: bool,
    /// Permit network access at all
    pub allow_network: bool,
    /// Backoff for transient network failures
    pub retry: RetryConfig,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            verify_checksum: false,
            force_download: false,
            allow_network: true,
            retry: RetryConfig::default(),
        }
    }
}

/// A downloaded archive waiting to be stored
///
/// The file is deleted when this is dropped.
#[derive(Debug)]
pub struct FetchedArchive {
    /// What was downloaded
    pub archive: RemoteArchive,
    /// SHA-512 (lowercase hex) of the downloaded bytes
    pub sha512: String,
    /// The archive on disk
    pub file: NamedTempFile,
}

impl FetchedArchive {
    /// Path of the downloaded archive
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Retrieves binary archives from an [`AssetSource`]
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn AssetSource>,
    policy: FetchPolicy,
}

impl Fetcher {
    /// Fetcher over `source` following `policy`
    pub fn new(source: Arc<dyn AssetSource>, policy: FetchPolicy) -> Self {
        Self { source, policy }
    }

    /// Policy in effect
    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Best published archive for `spec` on `platform`
    pub async fn select(&self, spec: &VersionSpec, platform: &Platform) -> Result<RemoteArchive> {
        if !self.policy.allow_network {
            return Err(network_disabled(spec, platform));
        }

        let source = &self.source;
        let archives = retry_with_backoff_if(
            &self.policy.retry,
            "list envtest releases",
            || async move { source.releases().await },
            Error::is_retryable,
        )
        .await?;

        let candidates: Vec<RemoteArchive> = archives
            .into_iter()
            .filter(|archive| &archive.platform == platform)
            .collect();
        let best = spec
            .best_match(candidates.iter().map(|archive| &archive.version))
            .cloned();

        best.and_then(|version| candidates.into_iter().find(|a| a.version == version))
            .ok_or_else(|| Error::VersionNotFound {
                spec: spec.to_string(),
                platform: platform.to_string(),
            })
    }

    /// Download the best archive for `spec` into a temporary file in `download_dir`
    ///
    /// `download_dir` should be on the same filesystem as the cache so the
    /// archive never crosses devices.
    pub async fn fetch(
        &self,
        spec: &VersionSpec,
        platform: &Platform,
        download_dir: &Path,
    ) -> Result<FetchedArchive> {
        let archive = self.select(spec, platform).await?;
        info!(
            spec = %spec,
            platform = %platform,
            version = %archive.version,
            archive = %archive.name,
            "Selected control plane release"
        );

        let source = &self.source;
        let selected = &archive;
        let (file, sha512) = retry_with_backoff_if(
            &self.policy.retry,
            "download envtest archive",
            || async move {
                let file = tempfile::Builder::new()
                    .prefix(".download-")
                    .suffix(".tar.gz")
                    .tempfile_in(download_dir)
                    .map_err(|e| Error::asset_write(download_dir, e))?;
                let sha512 = source.download(selected, file.path()).await?;
                Ok::<_, Error>((file, sha512))
            },
            Error::is_retryable,
        )
        .await?;

        if self.policy.verify_checksum {
            verify_checksum(&archive, &sha512)?;
        }

        Ok(FetchedArchive {
            archive,
            sha512,
            file,
        })
    }
}

fn verify_checksum(archive: &RemoteArchive, actual: &str) -> Result<()> {
    let Some(expected) = archive.sha512.as_deref() else {
        warn!(archive = %archive.name, "No published checksum to verify against");
        return Err(Error::Checksum {
            archive: archive.name.clone(),
            expected: "<unpublished>".to_string(),
            actual: actual.to_string(),
        });
    };
    if !expected.eq_ignore_ascii_case(actual) {
        return Err(Error::Checksum {
            archive: archive.name.clone(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn network_disabled(spec: &VersionSpec, platform: &Platform) -> Error {
    Error::NetworkDisabled {
        spec: spec.to_string(),
        platform: platform.to_string(),
    }
}
