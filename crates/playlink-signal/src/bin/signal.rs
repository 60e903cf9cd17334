//! PlayLink Signal Server
//!
//! WebSocket rendezvous server for session matchmaking and relay.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (port 8080, sessions kept for 1h of inactivity)
//! playlink-signal
//!
//! # Custom port and shorter retention, JSON logs
//! playlink-signal --port 9000 --retention-secs 600 --json
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use playlink_core::Config;
use playlink_signal::SignalServer;

#[derive(Parser, Debug)]
#[command(name = "playlink-signal")]
#[command(about = "PlayLink rendezvous server for session matchmaking")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides config)
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Idle session retention in seconds (overrides config)
    #[arg(long)]
    retention_secs: Option<u64>,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    // Initialize logging
    let json = args.json || config.logging.json;
    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let mut signal = config.signal;
    if let Some(port) = args.port {
        signal.port = port;
    }
    if let Some(bind) = &args.bind {
        signal.bind = bind.parse()?;
    }
    if let Some(secs) = args.retention_secs {
        signal.session_retention_secs = secs;
    }

    let addr = SocketAddr::new(signal.bind, signal.port);

    info!("Starting PlayLink Signal Server");
    info!(
        "Session retention {}s, sweep every {}s, default capacity {}",
        signal.session_retention_secs, signal.sweep_interval_secs, signal.default_capacity
    );

    let server = SignalServer::new(signal);
    server.serve(addr).await?;

    Ok(())
}
