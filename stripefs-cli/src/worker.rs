use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;

use stripefs::config::WorkerConfig;
use stripefs::worker::control::ControlChannel;
use stripefs::worker::{direct, WorkerContext};
use stripefs_cli::trace;

/// How often idle per-file strands are swept up.
const STRAND_RECLAIM_INTERVAL: Duration = Duration::from_secs(60);
const STRAND_IDLE_TTL: Duration = Duration::from_secs(300);

/// stripefs data-function worker: stripes client files over the
/// storage nodes.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Configuration file path.
    #[clap(short = 'c', long = "config")]
    config: String,

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

    let cfg = WorkerConfig::load(&args.config).context("loading worker config")?;
    info!(
        "worker starting: {} storage host(s), replication={}, cache={}",
        cfg.hosts.len(),
        cfg.replication_size,
        if cfg.cache_enabled { cfg.cache_policy.as_str() } else { "off" }
    );

    let ctx = WorkerContext::from_config(&cfg)?;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.listen_port)).await?;
    info!("direct clients on :{}", cfg.listen_port);
    tokio::spawn(direct::serve(listener, ctx.clone()));

    // Periodic strand reclamation keeps the per-file registry bounded.
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STRAND_RECLAIM_INTERVAL);
            loop {
                tick.tick().await;
                let reclaimed = ctx.strands.reclaim_idle(STRAND_IDLE_TTL);
                if reclaimed > 0 {
                    log::debug!("reclaimed {} idle strand(s)", reclaimed);
                }
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    match &cfg.proxy_host {
        Some(host) => {
            let proxy: SocketAddr = format!("{}:{}", host, cfg.proxy_port)
                .parse()
                .map_err(|e| anyhow!("bad proxy endpoint: {}", e))?;
            let channel = ControlChannel::new(ctx, proxy, &cfg, shutdown_rx);
            let control = tokio::spawn(channel.run());

            tokio::select! {
                state = control => {
                    info!("control channel finished: {:?}", state??);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("stopping on signal, deregistering");
                    let _ = shutdown_tx.send(true);
                    // Give the deregister packet a moment to drain.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
        None => {
            info!("no proxy configured, serving direct clients only");
            tokio::signal::ctrl_c().await?;
            info!("stopping on signal");
        }
    }

    Ok(())
}
