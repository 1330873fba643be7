//! `kubelive serve`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use kubelive_common::{DirectoryBundle, DEFAULT_PROXY_ADDR};
use kubelive_proxy::{serve, EmulationProxy, ReqwestUpstreamClient, ServerConfig, UpstreamConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Arguments for `kubelive serve`
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Bundle directory
    #[arg(long)]
    pub bundle: PathBuf,

    /// Kubeconfig of the ephemeral API server holding the bundle's objects
    #[arg(long, env = "KUBELIVE_UPSTREAM_KUBECONFIG")]
    pub upstream_kubeconfig: PathBuf,

    /// Address the proxy listens on
    #[arg(long, default_value = DEFAULT_PROXY_ADDR)]
    pub listen: SocketAddr,
}

/// Run the emulation proxy until `shutdown` is cancelled
pub async fn run(args: ServeArgs, shutdown: CancellationToken) -> anyhow::Result<()> {
    let bundle = DirectoryBundle::open(&args.bundle)
        .with_context(|| format!("failed to open bundle {}", args.bundle.display()))?;

    let upstream_config = UpstreamConfig::from_kubeconfig(&args.upstream_kubeconfig)
        .with_context(|| {
            format!(
                "failed to load upstream kubeconfig {}",
                args.upstream_kubeconfig.display()
            )
        })?;
    info!(server = %upstream_config.server, "Using ephemeral API server");
    let upstream = ReqwestUpstreamClient::new(&upstream_config)?;

    let proxy = EmulationProxy::new(Arc::new(bundle), Arc::new(upstream));
    serve(ServerConfig { addr: args.listen }, proxy, shutdown).await?;
    Ok(())
}
