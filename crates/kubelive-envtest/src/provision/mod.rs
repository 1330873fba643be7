//! Producing a ready-to-run control plane binary set
//!
//! Repeat runs for the same version family are served from the cache
//! without network access. The first run (or a forced refresh) downloads
//! an archive into the cache root and publishes it atomically.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kubelive_common::Bundle;
use semver::Version;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::fetch::{FetchPolicy, Fetcher};
use crate::platform::Platform;
use crate::remote::{AssetSource, HttpAssetSource};
use crate::store::{AssetStore, ExistingEntry};
use crate::version::{resolve, VersionSpec};

/// Provisioning configuration
#[derive(Clone, Debug)]
pub struct EnvtestConfig {
    /// Directory holding the asset cache
    pub cache_root: PathBuf,
    /// Platform to provision binaries for
    pub platform: Platform,
    /// Fetch behaviour
    pub policy: FetchPolicy,
}

impl EnvtestConfig {
    /// Configuration for the current platform with default fetch policy
    pub fn new(cache_root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            cache_root: cache_root.into(),
            platform: Platform::current()?,
            policy: FetchPolicy::default(),
        })
    }

    /// `<data dir>/kubelive/envtest`
    pub fn default_cache_root() -> Result<PathBuf> {
        dirs::data_dir()
            .map(|dir| dir.join("kubelive").join("envtest"))
            .ok_or_else(|| {
                Error::configuration("cannot determine data directory; set a cache directory")
            })
    }

    /// Reject configurations that can never provision anything
    pub fn validate(&self) -> Result<()> {
        if self.cache_root.as_os_str().is_empty() {
            return Err(Error::configuration("cache root must not be empty"));
        }
        if !self.platform.is_complete() {
            return Err(Error::configuration(format!(
                "incomplete platform '{}'",
                self.platform
            )));
        }
        Ok(())
    }
}

/// A validated binary set for one version and platform
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedEnvironment {
    /// Directory containing the control plane binaries
    pub binary_assets_dir: PathBuf,
    /// Release the binaries belong to
    pub version: Version,
    /// Platform the binaries run on
    pub platform: Platform,
}

impl ProvisionedEnvironment {
    /// Path of the kube-apiserver binary
    pub fn kube_apiserver_path(&self) -> PathBuf {
        self.binary_assets_dir.join("kube-apiserver")
    }

    /// Path of the etcd binary
    pub fn etcd_path(&self) -> PathBuf {
        self.binary_assets_dir.join("etcd")
    }

    /// Path of kubectl, when the archive shipped it
    pub fn kubectl_path(&self) -> Option<PathBuf> {
        let path = self.binary_assets_dir.join("kubectl");
        path.is_file().then_some(path)
    }
}

/// Turns a version selector into a [`ProvisionedEnvironment`]
pub struct Provisioner {
    store: AssetStore,
    fetcher: Fetcher,
    platform: Platform,
}

impl Provisioner {
    /// Provisioner downloading from the public release index
    pub fn new(config: EnvtestConfig) -> Result<Self> {
        Self::with_source(config, Arc::new(HttpAssetSource::new()?))
    }

    /// Provisioner downloading from `source`
    pub fn with_source(config: EnvtestConfig, source: Arc<dyn AssetSource>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: AssetStore::new(config.cache_root),
            fetcher: Fetcher::new(source, config.policy),
            platform: config.platform,
        })
    }

    /// The underlying cache
    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    /// Platform binaries are provisioned for
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Resolve the bundle's version and provision it
    pub async fn prepare(
        &self,
        bundle: &dyn Bundle,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedEnvironment> {
        let spec = resolve(bundle)?;
        self.provision(&spec, cancel).await
    }

    /// Provision binaries satisfying `spec`
    ///
    /// Cancellation returns [`Error::Cancelled`] and publishes no cache
    /// entry; every other failure is wrapped in [`Error::Provisioning`].
    pub async fn provision(
        &self,
        spec: &VersionSpec,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedEnvironment> {
        match self.provision_inner(spec, cancel).await {
            Ok(env) => Ok(env),
            Err(Error::Cancelled) => {
                info!(spec = %spec, "Provisioning cancelled");
                Err(Error::Cancelled)
            }
            Err(e) => {
                error!(spec = %spec, platform = %self.platform, error = %e, "Provisioning failed");
                Err(Error::Provisioning {
                    spec: spec.to_string(),
                    platform: self.platform.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    async fn provision_inner(
        &self,
        spec: &VersionSpec,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedEnvironment> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let policy = self.fetcher.policy();
        if policy.force_download {
            debug!(spec = %spec, "Forced download, skipping cache");
        } else if let Some(entry) = self.store.lookup(spec, &self.platform) {
            info!(
                spec = %spec,
                version = %entry.version,
                path = %entry.path.display(),
                "Using cached control plane binaries"
            );
            return Ok(ProvisionedEnvironment {
                binary_assets_dir: entry.path,
                version: entry.version,
                platform: entry.platform,
            });
        }

        self.store.ensure_base_dirs()?;
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            fetched = self.fetcher.fetch(spec, &self.platform, self.store.root()) => fetched?,
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let version = fetched.archive.version.clone();
        let existing = if policy.force_download {
            ExistingEntry::Replace
        } else {
            ExistingEntry::Keep
        };

        let store = self.store.clone();
        let platform = self.platform.clone();
        let stored_version = version.clone();
        let path = tokio::task::spawn_blocking(move || {
            store.store(&stored_version, &platform, fetched.path(), existing)
        })
        .await
        .map_err(|e| Error::asset_write(self.store.root(), std::io::Error::other(e)))??;

        ensure_valid(&self.store, &path)?;
        Ok(ProvisionedEnvironment {
            binary_assets_dir: path,
            version,
            platform: self.platform.clone(),
        })
    }
}

fn ensure_valid(store: &AssetStore, path: &Path) -> Result<()> {
    if store.validate(path) {
        return Ok(());
    }
    Err(Error::AssetValidation {
        path: path.to_path_buf(),
        message: format!(
            "missing binaries after store: {}",
            crate::store::missing_binaries(path).join(", ")
        ),
    })
}

/// Resolve the bundle's version and provision binaries for it
///
/// Startup entry point: the result is handed to whatever launches the
/// control plane.
pub async fn prepare(
    bundle: &dyn Bundle,
    config: EnvtestConfig,
    cancel: &CancellationToken,
) -> Result<ProvisionedEnvironment> {
    Provisioner::new(config)?.prepare(bundle, cancel).await
}
