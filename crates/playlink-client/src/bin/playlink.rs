//! PlayLink CLI - join sessions and check the rendezvous server
//!
//! Usage:
//!   playlink join <session> --name <name>   Join a session and follow its events
//!   playlink lobby                          List open sessions
//!   playlink probe                          Check server health once
//!   playlink config                         Print a sample configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};

use playlink_client::{ClientContext, HealthProbe, HttpHealthProbe};
use playlink_core::diagnostics::init_tracing;
use playlink_core::{Config, CorrelationId, ServerMessage};

#[derive(Parser)]
#[command(name = "playlink")]
#[command(about = "PlayLink session client", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Rendezvous server URL (overrides config)
    #[arg(short, long, global = true, env = "PLAYLINK_SERVER")]
    server: Option<String>,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a session and print its events until Ctrl+C
    Join {
        /// Session id (created if it does not exist)
        session: String,

        /// Display name
        #[arg(short, long, default_value = "player")]
        name: String,

        /// Dump buffered diagnostics as JSON on exit
        #[arg(long)]
        dump_logs: bool,
    },

    /// List sessions waiting for players
    Lobby,

    /// Check the rendezvous health endpoint once
    Probe,

    /// Print a sample configuration file
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(server) = &cli.server {
        config.client.rendezvous_url = server.clone();
    }
    if cli.verbose {
        config.logging.level = "debug".into();
    }
    config.logging.json |= cli.json;

    let correlation_id = CorrelationId::new();
    let diagnostics = init_tracing(&config.logging, correlation_id.clone());

    match cli.command {
        Commands::Join {
            session,
            name,
            dump_logs,
        } => {
            let result = run_join(config, correlation_id, &session, &name).await;
            if dump_logs {
                println!("{}", diagnostics.export_json()?);
            }
            result?;
        }
        Commands::Lobby => run_lobby(config, correlation_id).await?,
        Commands::Probe => run_probe(&config).await?,
        Commands::Config => print!("{}", Config::sample()),
    }

    Ok(())
}

async fn run_join(
    config: Config,
    correlation_id: CorrelationId,
    session_id: &str,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = ClientContext::new(config, correlation_id);
    let client = ctx.session().clone();
    client.set_progress_observer(Arc::new(|attempt, max, delay| {
        warn!("Connection attempt {}/{} failed, retrying in {:?}", attempt, max, delay);
    }));

    ctx.start(None)?;
    client.connect().await?;

    let mut events = client.subscribe();
    let membership = client.join(session_id, name).await?;
    info!(
        "Joined {} as {} ({})",
        membership.session_id,
        membership.participant_id,
        if membership.is_host { "host" } else { "player" }
    );
    for p in &membership.roster {
        info!("  {}{}", p.name, if p.is_host { " [host]" } else { "" });
    }

    let mut alerts = ctx.quality().subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ServerMessage::PlayerJoined { player, .. }) => info!("{} joined", player.name),
                Ok(ServerMessage::PlayerLeft { player_id, .. }) => info!("{} left", player_id),
                Ok(ServerMessage::HostChanged { host_name, .. }) => info!("{} is now host", host_name),
                Ok(ServerMessage::ChatReceived { player_name, message, .. }) => {
                    info!("<{}> {}", player_name, message)
                }
                Ok(ServerMessage::SessionError { error }) => warn!("Server: {}", error),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dropped {} events", n)
                }
                Err(_) => break,
            },
            alert = alerts.recv() => {
                if let Ok(alert) = alert {
                    warn!("Quality {:?}: {}", alert.level, alert.message);
                }
            }
            _ = signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    ctx.shutdown().await;
    Ok(())
}

async fn run_lobby(config: Config, correlation_id: CorrelationId) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = ClientContext::new(config, correlation_id);
    let client = ctx.session();
    client.connect().await?;

    let mut events = client.subscribe();
    client.request_lobby();

    let reply = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(ServerMessage::LobbySessions { sessions }) => return Some(sessions),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await;

    match reply {
        Ok(Some(sessions)) if sessions.is_empty() => println!("No open sessions"),
        Ok(Some(sessions)) => {
            for s in sessions {
                println!(
                    "{:<20} {:<24} {}/{}  {}",
                    s.id,
                    s.title,
                    s.player_count(),
                    s.capacity,
                    s.host().map(|h| h.name.as_str()).unwrap_or("-")
                );
            }
        }
        _ => error!("No lobby reply from server"),
    }

    client.disconnect().await;
    Ok(())
}

async fn run_probe(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let url = config.health_url();
    let probe = HttpHealthProbe::new(&url, config.monitor.probe_timeout())?;
    match probe.probe().await {
        Ok(()) => {
            println!("{}: online", url);
            Ok(())
        }
        Err(e) => {
            println!("{}: offline ({})", url, e);
            Err(e.into())
        }
    }
}
