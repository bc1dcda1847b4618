// softmesh-cli: command-line front end for the SoftMesh engine
//
// Configures the engine, and runs a self-contained demo mesh over loopback
// adapters so the discovery/negotiation/session pipeline can be watched
// without any radio hardware.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use softmesh_core::adapter::loopback::LoopbackAdapter;
use softmesh_core::{
    current_timestamp_ms, start_engine, DiscoveryRegistry, Dispatcher, EngineEvent, EngineHandle,
    PeerResolver, ServiceNameResolver, SessionId, TransportCapability, TransportKind,
    TransportScopedResolver,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "softmesh")]
#[command(about = "SoftMesh: cross-transport device discovery and sessions", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the default configuration
    Init,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show the current configuration
    Status,
    /// Run a simulated mesh over loopback transports
    Demo {
        /// Number of simulated peers
        #[arg(short, long, default_value = "3")]
        peers: usize,
        /// How long to run, in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => cmd_init(),
        Commands::Config { action } => cmd_config(action),
        Commands::Status => cmd_status(),
        Commands::Demo { peers, duration } => cmd_demo(peers, duration).await,
    }
}

fn cmd_init() -> Result<()> {
    println!("{}", "Initializing SoftMesh...".bold());
    println!();

    let config = config::Config::load()?;
    println!("  {} Configuration", "✓".green());
    println!(
        "  {} Config file: {}",
        "✓".green(),
        config::Config::config_file()?.display()
    );
    println!("  {} Identity: {}", "✓".green(), config.identity.bright_cyan());
    println!();
    println!("{}", "Next steps:".bold());
    println!(
        "  • Tune the engine: {}",
        "softmesh config set engine.handshake_timeout_ms 2000".bright_green()
    );
    println!("  • Watch it run:    {}", "softmesh demo".bright_green());

    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            let mut config = config::Config::load()?;
            config.set(&key, &value)?;
            config.save().context("Failed to save config")?;
            println!("{} {} = {}", "Set".green(), key.bold(), value);
        }
        ConfigAction::Get { key } => {
            let config = config::Config::load()?;
            println!("{}", config.get(&key)?);
        }
        ConfigAction::List => {
            let config = config::Config::load()?;
            for key in config::Config::keys() {
                println!("{} = {}", key.bold(), config.get(key)?);
            }
        }
    }
    Ok(())
}

fn cmd_status() -> Result<()> {
    let config = config::Config::load()?;
    println!("{}", "SoftMesh Configuration".bold());
    println!("  Identity:           {}", config.identity.bright_cyan());
    println!(
        "  Correlate peers:    {}",
        config.engine.correlate_across_transports
    );
    println!(
        "  Silence timeout:    {} ms",
        config.engine.silence_timeout_ms
    );
    println!(
        "  Handshake timeout:  {} ms",
        config.engine.handshake_timeout_ms
    );
    println!("  Max retries:        {}", config.engine.max_retries);
    println!(
        "  Heartbeat timeout:  {} ms",
        config.engine.heartbeat_timeout_ms
    );
    let priority: Vec<String> = config
        .engine
        .transport_priority
        .iter()
        .map(|k| k.to_string())
        .collect();
    println!("  Transport priority: {}", priority.join(" > "));
    Ok(())
}

async fn cmd_demo(peers: usize, duration: u64) -> Result<()> {
    let config = config::Config::load()?;
    println!(
        "{} {} simulated peer(s) for {}s as {}",
        "Starting demo mesh:".bold(),
        peers,
        duration,
        config.identity.bright_cyan()
    );

    let resolver: Box<dyn PeerResolver> = if config.engine.correlate_across_transports {
        Box::new(ServiceNameResolver)
    } else {
        Box::new(TransportScopedResolver)
    };

    let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let registry = Arc::new(DiscoveryRegistry::new(
        resolver,
        config.engine.silence_timeout_ms,
    ));
    let dispatcher = Arc::new(Dispatcher::new(registry.clone()));

    let ble = Arc::new(LoopbackAdapter::new(TransportKind::BLE, adapter_tx.clone()));
    let wifi = Arc::new(LoopbackAdapter::new(
        TransportKind::WiFiDirect,
        adapter_tx.clone(),
    ));
    dispatcher
        .register_adapter(TransportCapability::for_kind(TransportKind::BLE), ble.clone())
        .context("register BLE adapter")?;
    dispatcher
        .register_adapter(
            TransportCapability::for_kind(TransportKind::WiFiDirect),
            wifi.clone(),
        )
        .context("register WiFiDirect adapter")?;
    dispatcher.initialize_all().await.context("initialize adapters")?;

    let handle = start_engine(
        config.engine.clone(),
        registry,
        dispatcher,
        adapter_rx,
        event_tx,
    );
    handle.start_discovery().await?;
    handle.start_advertising(config.identity.clone()).await?;

    // Simulated neighborhood: every peer is visible on both transports with
    // BLE the stronger signal for odd peers, Wi-Fi Direct for even ones.
    let now = current_timestamp_ms();
    for i in 0..peers {
        let (ble_signal, wifi_signal) = if i % 2 == 0 { (0.4, 0.9) } else { (0.9, 0.4) };
        ble.inject_advertisement(&format!("peer-{}@aa:bb:{:02x}", i, i), ble_signal, now);
        wifi.inject_advertisement(
            &format!("peer-{}@192.168.49.{}", i, i + 2),
            wifi_signal,
            now,
        );
    }

    run_event_loop(&handle, &mut event_rx, Duration::from_secs(duration)).await;

    println!();
    println!("{}", "Final state".bold());
    for peer in handle.list_peers().await.unwrap_or_default() {
        println!(
            "  {} on {} transport(s), state {}",
            peer.peer_id.to_string().bright_cyan(),
            peer.transports.len(),
            peer.negotiation_state
        );
    }
    for session in handle.list_sessions().await.unwrap_or_default() {
        let status = if session.closed {
            "closed".red()
        } else {
            "active".green()
        };
        println!(
            "  {} -> {} via {} [{}], {}B out",
            session.session_id.to_string().dimmed(),
            session.peer_id.to_string().bright_cyan(),
            session.transport,
            status,
            session.stats.bytes_sent
        );
    }

    handle.shutdown().await?;
    Ok(())
}

async fn run_event_loop(
    handle: &EngineHandle,
    event_rx: &mut mpsc::Receiver<EngineEvent>,
    duration: Duration,
) {
    let deadline = Instant::now() + duration;
    let mut live: Vec<SessionId> = Vec::new();
    let mut keepalive = tokio::time::interval(Duration::from_secs(2));

    while Instant::now() < deadline {
        tokio::select! {
            Some(event) = event_rx.recv() => match event {
                EngineEvent::PeerDiscovered(record) => {
                    println!(
                        "  {} {}",
                        "discovered".bright_yellow(),
                        record.peer_id.to_string().bright_cyan()
                    );
                }
                EngineEvent::PeerExpired(peer_id) => {
                    println!("  {} {}", "expired".dimmed(), peer_id);
                }
                EngineEvent::SessionEstablished(session) => {
                    println!(
                        "  {} {} via {}",
                        "established".green(),
                        session.peer_id.to_string().bright_cyan(),
                        session.transport
                    );
                    let _ = handle
                        .send(session.session_id.clone(), b"hello from softmesh".to_vec())
                        .await;
                    live.push(session.session_id);
                }
                EngineEvent::SessionClosed { peer_id, reason, session_id } => {
                    println!("  {} {} ({})", "closed".red(), peer_id, reason);
                    live.retain(|id| *id != session_id);
                }
                EngineEvent::NegotiationFailed { peer_id, reason } => {
                    println!("  {} {} ({})", "failed".red(), peer_id, reason);
                }
            },
            _ = keepalive.tick() => {
                for session_id in &live {
                    let _ = handle.heartbeat(session_id.clone()).await;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
    }
}
