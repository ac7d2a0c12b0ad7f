//! keepalive-daemon: monitors remote peers with UDP keepalives and logs
//! every UP/DOWN transition until interrupted.

use anyhow::Result;
use clap::Parser;
use keepalive_core::Monitor;
use keepalive_daemon::{load_config, ConfigOverrides};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "keepalive-daemon")]
#[command(about = "UDP keepalive liveness monitor")]
struct Args {
    /// JSON config file (flags override its fields)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local IP address to receive keepalives on
    #[arg(short, long)]
    local: Option<String>,

    /// UDP port used locally and on every remote peer
    #[arg(short, long)]
    port: Option<u32>,

    /// Remote peer IP address (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Priority advertised in keepalives
    #[arg(long)]
    priority: Option<u8>,

    /// Keepalive interval in milliseconds
    #[arg(long)]
    interval_ms: Option<u32>,

    /// Dead interval in milliseconds
    #[arg(long)]
    dead_interval_ms: Option<u32>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,keepalive_core=debug,keepalive_daemon=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let base = args.config.as_deref().map(load_config).transpose()?;
    let config = ConfigOverrides {
        local: args.local,
        port: args.port,
        peers: args.peers,
        priority: args.priority,
        interval_ms: args.interval_ms,
        dead_interval_ms: args.dead_interval_ms,
    }
    .apply(base)?;

    info!("Starting keepalive-daemon");
    info!("Local address: {} port {}", config.local_address, config.port);
    info!(
        "Interval {}ms, dead interval {}ms",
        config.session.interval_ms, config.session.dead_interval_ms
    );

    let mut monitor = Monitor::start(config).await?;
    if monitor.peers().is_empty() {
        warn!("No remote peer session could be created");
    }
    let mut events = monitor.subscribe()?;

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                match serde_json::to_string(&event) {
                    Ok(json) => println!("{}", json),
                    Err(e) => warn!("Failed to serialize event: {}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    monitor.stop().await?;
    info!("Shutting down");
    Ok(())
}
