use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;

use stripefs::proxy::ProxyServer;
use stripefs_cli::trace;

/// stripefs proxy front: registers workers and routes client jobs to
/// them.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Listen on this port.
    #[clap(short = 'l', long, default_value_t = 12000)]
    listen: u16,

    /// Keepalive deadline pushed to workers, in milliseconds.
    #[clap(short = 'k', long, default_value_t = 10_000)]
    keepalive_ms: u64,

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

    let proxy = ProxyServer::new(Duration::from_millis(args.keepalive_ms.max(1)));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.listen)).await?;
    info!("proxy on :{} keepalive={}ms", args.listen, args.keepalive_ms);

    tokio::select! {
        result = proxy.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("stopping on signal");
        }
    }
    Ok(())
}
