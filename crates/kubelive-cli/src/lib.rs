//! kubelive CLI library

pub mod commands;

use clap::{Parser, Subcommand};
use kubelive_common::telemetry::LogFormat;
use tokio_util::sync::CancellationToken;

/// kubelive - inspect a captured support bundle as if the cluster were live
#[derive(Parser, Debug)]
#[command(name = "kubelive")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format (text or json)
    #[arg(long, global = true, env = "KUBELIVE_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision control plane binaries matching a bundle
    Provision(commands::provision::ProvisionArgs),
    /// Serve a bundle through the emulation proxy
    Serve(commands::serve::ServeArgs),
    /// Inspect the local asset cache
    #[command(subcommand)]
    Cache(commands::cache::CacheCommand),
}

impl Cli {
    /// Run the CLI command until it finishes or `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        match self.command {
            Commands::Provision(args) => commands::provision::run(args, shutdown).await,
            Commands::Serve(args) => commands::serve::run(args, shutdown).await,
            Commands::Cache(command) => commands::cache::run(command),
        }
    }
}
