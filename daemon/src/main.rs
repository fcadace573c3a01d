//! Morph Daemon
//!
//! The relay endpoint that admits clients, unwraps their disguised packets
//! and forwards them to the local WireGuard interface.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use morph_daemon::{DaemonConfig, Metrics, Relay, accounting, metrics};

/// Morph Daemon - obfuscating UDP relay
#[derive(Parser, Debug)]
#[command(name = "morphd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "daemon.toml")]
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

    info!("Morph Daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = DaemonConfig::load(&args.config).await?;
    info!("Loaded configuration from {}", args.config);

    // Start metrics server
    let metrics_handle = metrics::start_server(&config.monitoring);
    let relay_metrics = Arc::new(Metrics::new()?);

    let accounting: Arc<dyn morph_daemon::Accounting> =
        Arc::from(accounting::from_config(&config.accounting)?);

    info!("Tunnel endpoint {}", config.tunnel.local_address);
    let relay = Relay::bind(config, accounting, relay_metrics).await?;

    tokio::select! {
        result = relay.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    // Cleanup
    metrics_handle.abort();

    Ok(())
}
