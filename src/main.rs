use std::time::Duration;

use clap::Parser;
use cli::JumpgateCli;
use config::TunnelConfig;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tunneling::tunnel::{TunnelError, TunnelManager};

mod cli;
mod config;
mod storage;
mod tunneling;

#[tokio::main]
pub async fn main() -> Result<(), TunnelError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = JumpgateCli::parse();
    let loaded_config = TunnelConfig::load(cli.config.as_deref())?;
    let mut manager = TunnelManager::new(loaded_config);
    manager
        .create_tunnel(cli.local_port, cli.remote_port, &cli.remote_host)
        .await?;

    match cli.watch {
        Some(secs) => {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !manager.auto_tunnel_reconnect().await {
                            warn!("tunnel is down and the reconnect attempt failed");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
        }
    }

    manager.close().await;
    Ok(())
}
