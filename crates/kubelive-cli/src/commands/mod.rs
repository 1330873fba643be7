//! CLI commands

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use kubelive_envtest::EnvtestConfig;

pub mod cache;
pub mod provision;
pub mod serve;

/// Location of the asset cache
#[derive(Args, Debug, Clone, Default)]
pub struct CacheArgs {
    /// Asset cache directory [default: <data dir>/kubelive/envtest]
    #[arg(long, env = "KUBELIVE_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,
}

impl CacheArgs {
    /// Explicit directory, else the per-user default
    pub fn cache_root(&self) -> anyhow::Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(EnvtestConfig::default_cache_root()?),
        }
    }
}

/// How binaries may be fetched
#[derive(Args, Debug, Clone, Default)]
pub struct PolicyArgs {
    /// Fail when a download does not match its published SHA-512
    #[arg(long, env = "KUBELIVE_VERIFY_CHECKSUM")]
    pub verify_checksum: bool,

    /// Download even when the cache already holds a usable entry
    #[arg(long, env = "KUBELIVE_FORCE_DOWNLOAD")]
    pub force_download: bool,

    /// Never touch the network; only cached binaries are used
    #[arg(long, env = "KUBELIVE_OFFLINE")]
    pub offline: bool,
}

/// Provisioning configuration for the current platform
pub fn envtest_config(cache: &CacheArgs, policy: &PolicyArgs) -> anyhow::Result<EnvtestConfig> {
    let mut config = EnvtestConfig::new(cache.cache_root()?)
        .context("failed to build provisioning configuration")?;
    config.policy.verify_checksum = policy.verify_checksum;
    config.policy.force_download = policy.force_download;
    config.policy.allow_network = !policy.offline;
    config.validate()?;
    Ok(config)
}
