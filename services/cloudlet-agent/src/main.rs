//! cloudlet-forward
//!
//! Exposes a handoff receiver that is only reachable on an internal network.
//! Binds an ephemeral port, prints it on stdout and relays exactly one client
//! connection to `--dest-ip:--dest-port`.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cloudlet_agent::tunnel::PortForward;

#[derive(Debug, Parser)]
#[command(name = "cloudlet-forward", version, about = "Forward one handoff stream")]
struct Args {
    /// Address of the handoff receiver.
    #[arg(long)]
    dest_ip: String,

    /// Port of the handoff receiver.
    #[arg(long)]
    dest_port: u16,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "CLOUDLET_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Stdout carries the port; logs go to stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let handle = PortForward::new(args.dest_ip.clone(), args.dest_port)
        .start()
        .await?;
    println!("{}", handle.local_port());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = handle.wait() => {
            match result {
                Ok(stats) => info!(
                    client_to_dest = stats.client_to_dest,
                    dest_to_client = stats.dest_to_client,
                    "Tunnel finished"
                ),
                Err(e) => {
                    error!(error = %e, "Tunnel failed");
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}
