use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use replicated_kv::{
    cli::{Cli, Command},
    client,
    follower::Follower,
    leader::Leader,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Leader(args) => {
            let client_listener = TcpListener::bind(args.client_listen)
                .await
                .with_context(|| format!("failed to bind client endpoint {}", args.client_listen))?;
            let follower_listener = TcpListener::bind(args.follower_listen)
                .await
                .with_context(|| format!("failed to bind follower endpoint {}", args.follower_listen))?;
            let config = args.config();
            info!(mode = ?config.mode, acks = ?config.acks, conflict = ?config.conflict, "starting leader");

            let leader = Leader::new(client_listener, follower_listener, config);
            info!("client endpoint listening on {}", leader.client_addr()?);
            info!("follower endpoint listening on {}", leader.follower_addr()?);
            if let Err(err) = leader.run_until_ctrl_c().await {
                warn!("leader exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Follower(args) => {
            let follower = Follower::new(args.config());
            if let Err(err) = follower.run_until_ctrl_c().await {
                warn!("follower exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
