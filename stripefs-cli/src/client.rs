use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use stripefs::client::Client;
use stripefs::uuid::FileId;
use stripefs_cli::trace;

/// Test client for a stripefs worker.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Worker endpoint, host:port.
    #[clap(short = 'w', long, default_value = "127.0.0.1:2000")]
    worker: String,

    #[clap(long, default_value = "warn")]
    log_level: String,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write bytes into a named file.
    Write {
        /// File name; hashed into the 32-byte file id.
        name: String,
        position: u32,
        /// Payload, taken verbatim.
        data: String,
    },
    /// Read a range of a named file.
    Read {
        name: String,
        position: u32,
        size: u32,
    },
    /// Print the file id of a name.
    Id { name: String },
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();
    let _guards = trace::init_logging(None, &args.log_level).await?;

    match args.cmd {
        Command::Write { name, position, data } => {
            let file = FileId::from_name(&name);
            let mut client = Client::connect(&args.worker).await.context("connecting to worker")?;
            client.write(&file, position, data.into_bytes()).await?;
            println!("OK");
        }
        Command::Read { name, position, size } => {
            let file = FileId::from_name(&name);
            let mut client = Client::connect(&args.worker).await.context("connecting to worker")?;
            let data = client.read(&file, position, size).await?;
            println!("{}", String::from_utf8_lossy(&data));
        }
        Command::Id { name } => {
            println!("{}", FileId::from_name(&name));
        }
    }
    Ok(())
}
