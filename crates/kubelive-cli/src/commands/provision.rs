//! `kubelive provision`

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use kubelive_common::DirectoryBundle;
use kubelive_envtest::{Provisioner, VersionSpec};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{envtest_config, CacheArgs, PolicyArgs};

/// Arguments for `kubelive provision`
#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// Bundle directory; its version is used unless --k8s-version is given
    #[arg(long, required_unless_present = "k8s_version")]
    pub bundle: Option<PathBuf>,

    /// Version to provision instead of the bundle's (e.g. 1.27 or 1.27.3)
    #[arg(long)]
    pub k8s_version: Option<VersionSpec>,

    #[command(flatten)]
    pub cache: CacheArgs,

    #[command(flatten)]
    pub policy: PolicyArgs,
}

/// Provision binaries and print the directory holding them
pub async fn run(args: ProvisionArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = envtest_config(&args.cache, &args.policy)?;
    let provisioner = Provisioner::new(config)?;

    let env = match args.k8s_version {
        Some(spec) => {
            info!(spec = %spec, "Using version from command line");
            provisioner.provision(&spec, &shutdown).await?
        }
        None => {
            let path = args
                .bundle
                .context("either --bundle or --k8s-version is required")?;
            let bundle = DirectoryBundle::open(&path)
                .with_context(|| format!("failed to open bundle {}", path.display()))?;
            provisioner.prepare(&bundle, &shutdown).await?
        }
    };

    info!(
        version = %env.version,
        platform = %env.platform,
        path = %env.binary_assets_dir.display(),
        "Control plane binaries ready"
    );
    println!("{}", env.binary_assets_dir.display());
    Ok(())
}
