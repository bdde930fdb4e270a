//! Chunkserver daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dfs_chunkserver::server::{self, Shared};
use dfs_chunkserver::{ChunkStore, ChunkserverConfig};

#[derive(Parser, Debug)]
#[command(name = "dfsd", about = "Chunkserver daemon")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address override (host:port).
    #[arg(long)]
    listen: Option<String>,

    /// Master address to register with (host:port).
    #[arg(long)]
    master: Option<String>,

    /// Chunk data directory override.
    #[arg(long)]
    data_dir: Option<String>,

    /// Log to syslog instead of stderr.
    #[arg(long)]
    syslog: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dfs_tools::logging::init("dfsd", cli.syslog, "info").context("failed to initialize logging")?;

    let file_config: ChunkserverConfig = dfs_tools::config::load_toml(cli.config.as_deref())?;
    let mut config = file_config;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(master) = cli.master {
        config.master_addr = master;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.network_workers.max(1) + config.hdd_workers_per_network_worker.max(1))
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        let store = Arc::new(ChunkStore::open(&config.data_dir)?);
        let shared = Arc::new(Shared { store, config });
        server::run(shared).await
    })
}
