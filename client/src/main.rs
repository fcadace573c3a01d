//! Morph Client
//!
//! Sits between the local WireGuard interface and a Morph relay.

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use morph_client::{Client, ClientConfig, ClientEvent};

/// Morph Client - disguised WireGuard transport
#[derive(Parser, Debug)]
#[command(name = "morph")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "client.toml")]
    config: String,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Morph Client v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ClientConfig::load(&args.config).await?;
    info!("Loaded configuration from {}", args.config);

    let (client, mut events) = Client::new(config).await?;
    info!("Point WireGuard at {}", client.local_addr()?);

    let events_handle = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Connected { port } => info!("Tunnel up via relay port {}", port),
                ClientEvent::Reconnected { port } => info!("Tunnel resumed via relay port {}", port),
                ClientEvent::Inactive => warn!("Relay expired the session"),
                ClientEvent::Stopped => info!("Tunnel stopped"),
            }
        }
    });

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let result = client.run(shutdown).await;

    // The event sender is gone with the client, drain what is left
    let _ = events_handle.await;

    Ok(result?)
}
