//! Ephemeral control plane provisioning
//!
//! Resolves the Kubernetes version a bundle was captured from and produces a
//! directory of ready-to-execute control plane binaries (kube-apiserver and
//! etcd) for that version family, fetching and caching them when needed.
//!
//! # Flow
//!
//! ```text
//! Bundle ──► resolve() ──► VersionSpec ──► Provisioner::provision()
//!                                             │
//!                        AssetStore::lookup ◄─┤ cache hit: validate, done
//!                                             │
//!                Fetcher::fetch ──► AssetStore::store ──► validate
//! ```
//!
//! The resulting [`ProvisionedEnvironment`] is handed to whatever launches the
//! control plane. Cache entries persist across runs.

#![deny(missing_docs)]

pub mod error;
pub mod fetch;
pub mod platform;
pub mod provision;
pub mod remote;
pub mod store;
pub mod version;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, Result};
pub use fetch::{FetchPolicy, FetchedArchive, Fetcher};
pub use platform::Platform;
pub use provision::{prepare, EnvtestConfig, ProvisionedEnvironment, Provisioner};
pub use remote::{AssetSource, HttpAssetSource, RemoteArchive};
pub use store::{AssetStore, CacheEntry, ExistingEntry};
pub use version::{resolve, VersionSpec};

/// Release version type used throughout the public API
pub use semver::Version;
