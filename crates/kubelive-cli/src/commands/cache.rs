//! `kubelive cache`

use std::fmt::Write as _;

use clap::Subcommand;
use kubelive_envtest::{AssetStore, CacheEntry};

use super::CacheArgs;

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List cached binary sets and whether they are usable
    List(CacheArgs),
}

/// Run a cache subcommand
pub fn run(command: CacheCommand) -> anyhow::Result<()> {
    match command {
        CacheCommand::List(args) => {
            let store = AssetStore::new(args.cache_root()?);
            let entries = store.entries()?;
            print!("{}", render_entries(&store, &entries));
            Ok(())
        }
    }
}

/// One line per entry: version, platform, validity, path
fn render_entries(store: &AssetStore, entries: &[CacheEntry]) -> String {
    if entries.is_empty() {
        return format!("no cached binaries in {}\n", store.root().display());
    }

    let mut out = String::new();
    for entry in entries {
        let state = if store.validate(&entry.path) {
            "valid"
        } else {
            "incomplete"
        };
        let _ = writeln!(
            out,
            "{:<12} {:<14} {:<10} {}",
            entry.version.to_string(),
            entry.platform.to_string(),
            state,
            entry.path.display()
        );
    }
    out
}
