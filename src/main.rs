use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use hopproxy::config::{Cli, ProxySetup};
use hopproxy::{redact_url, ProxyServer, ServerEvent};

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hopproxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let setup = ProxySetup::from_cli(&args)?;

    if let Some(upstream) = &args.upstream {
        info!("Chaining through upstream proxy {}", redact_url(upstream));
    }
    if args.auth.is_some() {
        info!("Clients must authenticate (realm \"{}\")", args.realm);
    }

    let mut server = match setup.hook {
        Some(hook) => ProxyServer::with_hook(setup.options, hook),
        None => ProxyServer::new(setup.options),
    };

    // Log lifecycle events the engine publishes
    let mut events = server.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ServerEvent::Connection { id, peer }) => {
                    debug!(id, %peer, "client connected");
                }
                Ok(ServerEvent::Request { id, method, target }) => {
                    debug!(id, %method, %target, "request");
                }
                Ok(ServerEvent::TunnelConnected { id, target }) => {
                    debug!(id, %target, "tunnel connected");
                }
                Ok(ServerEvent::ConnectionClosed { id, stats }) => {
                    debug!(
                        id,
                        bytes_up = stats.bytes_from_client,
                        bytes_down = stats.bytes_to_client,
                        "connection closed"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let local = server.listen().await?;
    info!("HTTP proxy listening on http://{local}");

    signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");

    let active = server.connection_count();
    if active > 0 {
        info!("Waiting for {active} connections to close...");
        if tokio::time::timeout(Duration::from_secs(30), server.close(false))
            .await
            .is_err()
        {
            warn!(
                "Forced shutdown with {} connections still active",
                server.connection_count()
            );
            server.close(true).await;
        }
    } else {
        server.close(false).await;
    }
    info!("Server shutdown complete");

    Ok(())
}
