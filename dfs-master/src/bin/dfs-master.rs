//! Master daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dfs_master::net::{self, MasterState, Shared};
use dfs_master::MasterConfig;

#[derive(Parser, Debug)]
#[command(name = "dfs-master", about = "Chunk metadata master daemon")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address override (host:port).
    #[arg(long)]
    listen: Option<String>,

    /// Log to syslog instead of stderr.
    #[arg(long)]
    syslog: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dfs_tools::logging::init("dfs-master", cli.syslog, "info")
        .context("failed to initialize logging")?;

    let file_config: MasterConfig = dfs_tools::config::load_toml(cli.config.as_deref())?;
    let mut config = file_config;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let shared = Arc::new(Shared { state: MasterState::default(), config });
    runtime.block_on(net::run(shared))
}
