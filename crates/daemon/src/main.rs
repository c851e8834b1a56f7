use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::signal;

use negotio::{Config, Daemon};

#[derive(Parser, Debug)]
#[command(author, version, about = "UDP key negotiation daemon", long_about = None)]
struct Args {
    #[arg(short, long, help = "Path to config file")]
    config: Option<PathBuf>,
    #[arg(short, long, help = "UDP port override")]
    port: Option<u16>,
    #[arg(short, long, help = "Control socket path override")]
    socket: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };
    if let Some(port) = args.port {
        config.network.udp_port = port;
    }
    if let Some(socket) = args.socket {
        config.network.unix_socket_path = socket;
    }

    info!(
        "starting negotiod on UDP/{} (control socket {})",
        config.network.udp_port, config.network.unix_socket_path
    );

    let mut daemon = Daemon::start(config).await?;

    signal::ctrl_c().await?;
    info!("shutting down...");
    daemon.shutdown().await;
    Ok(())
}
