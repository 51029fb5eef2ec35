use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use stripefs::block::BlockStore;
use stripefs::config::NodeConfig;
use stripefs::node;
use stripefs::storage::disk::DiskEngine;
use stripefs_cli::trace;

/// stripefs storage node: serves versioned blocks over TCP.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Configuration file path; flags below override it.
    #[clap(short = 'c', long = "config")]
    config: Option<String>,

    /// Listen on this port.
    #[clap(short = 'l', long)]
    listen: Option<u16>,

    /// Block database file.
    #[clap(short = 'd', long)]
    db: Option<String>,

    /// Block size in bytes.
    #[clap(short = 'b', long)]
    blocksize: Option<u32>,

    #[clap(long, default_value = "info")]
    log_level: String,

    /// Directory for rolling log files; stderr only when absent.
    #[clap(long)]
    log_dir: Option<String>,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();
    let _guards = trace::init_logging(args.log_dir.as_deref(), &args.log_level).await?;

    let mut cfg = match &args.config {
        Some(path) => NodeConfig::load(path).context("loading node config")?,
        None => NodeConfig::default(),
    };
    if let Some(listen) = args.listen {
        cfg.listen_port = listen;
    }
    if let Some(db) = args.db {
        cfg.db_path = db;
    }
    if let Some(blocksize) = args.blocksize {
        cfg.block_size = blocksize;
    }

    info!("opening block database {}", cfg.db_path);
    let engine = DiskEngine::open_compact(cfg.db_path.clone().into(), cfg.compact_ratio)?;
    let store = BlockStore::open(engine, cfg.block_size)?;
    info!("database status: {:?}", store.status()?);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.listen_port)).await?;
    info!("listening on :{} blocksize={}", cfg.listen_port, cfg.block_size);

    tokio::select! {
        result = node::serve(listener, store.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("stopping on signal");
        }
    }

    store.flush()?;
    Ok(())
}
