// datastream-cli — command-line host for the datastream core
//
// Identity, relay and discovery commands plus a long-running stream monitor.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use datastream_core::identity::KeyStore;
use datastream_core::monitor::{AlertKind, ObservationProbe};
use datastream_core::relay::{
    bootstrap_relay_urls, fetch_relay_information, verify_relay_identity, FileRelayUrlCache,
    RelayUrlCache,
};
use datastream_core::{
    identity_of, DatastreamSubscriber, EventSigner, LocalKeys, MultiRelayCoordinator, PublicKey,
    RelayState, StreamHealth,
};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "datastream")]
#[command(about = "Metered datastreams over open relays", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create config and keys
    Init,
    /// Show this client's public key
    Identity,
    /// Print the UUID of a stream
    Uuid { owner: String, name: String },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show relay health, optionally checking each relay's identity
    Relays {
        /// Expected operator key for NIP-11 identity checks
        #[arg(long)]
        operator: Option<String>,
    },
    /// Find announced streams
    Discover {
        #[arg(short, long)]
        tag: Vec<String>,
        /// Only streams currently within their cadence
        #[arg(short, long)]
        active: bool,
    },
    /// Watch stream health until interrupted
    Monitor {
        owner: String,
        name: String,
        /// Seconds between checks
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Subscribe and print observations until interrupted
    Subscribe { owner: String, name: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    AddRelay { url: String },
    RemoveRelay { url: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Init => cmd_init(),
        Commands::Identity => cmd_identity(),
        Commands::Uuid { owner, name } => cmd_uuid(&owner, &name),
        Commands::Config { action } => cmd_config(action),
        Commands::Relays { operator } => cmd_relays(operator).await,
        Commands::Discover { tag, active } => cmd_discover(tag, active).await,
        Commands::Monitor {
            owner,
            name,
            interval,
        } => cmd_monitor(&owner, &name, interval).await,
        Commands::Subscribe { owner, name } => cmd_subscribe(&owner, &name).await,
    }
}

fn load_keys(config: &config::Config) -> Result<LocalKeys> {
    let store = KeyStore::open(config.keys_path()?).context("Failed to open key store")?;
    store.load_or_generate().context("Failed to load keys")
}

/// Coordinator over the configured relays, falling back to the cached list
fn coordinator(config: &config::Config) -> Result<MultiRelayCoordinator> {
    let cache = FileRelayUrlCache::new(config.relay_cache_path()?);
    let urls = bootstrap_relay_urls(&config.client.relays, Some(&cache as &dyn RelayUrlCache));
    if urls.is_empty() {
        anyhow::bail!(
            "No relays configured. Add one with: {}",
            "datastream config add-relay wss://<relay>".bright_green()
        );
    }
    MultiRelayCoordinator::with_websocket_relays(config.client.coordinator.clone(), &urls)
        .context("Failed to set up relays")
}

fn health_label(health: StreamHealth) -> ColoredString {
    match health {
        StreamHealth::Active => "active".green(),
        StreamHealth::Stale => "stale".yellow(),
        StreamHealth::Dead => "dead".red(),
        StreamHealth::Unknown => "unknown".dimmed(),
    }
}

fn cmd_init() -> Result<()> {
    println!("{}", "Initializing datastream client...".bold());
    println!();

    let config = config::Config::load()?;
    println!("  {} Configuration: {}", "✓".green(), config::Config::config_file()?.display());
    println!("  {} Data directory: {}", "✓".green(), config.data_dir()?.display());

    let keys = load_keys(&config)?;
    println!("  {} Keys ready", "✓".green());
    println!();
    println!("Public Key: {}", keys.public_key().as_hex().bright_yellow());

    if config.client.relays.is_empty() {
        println!();
        println!("{}", "Next steps:".bold());
        println!(
            "  • Add a relay: {}",
            "datastream config add-relay wss://<relay>".bright_green()
        );
    }
    Ok(())
}

fn cmd_identity() -> Result<()> {
    let config = config::Config::load()?;
    let keys = load_keys(&config)?;
    println!("{}", "Identity".bold());
    println!("  Public Key: {}", keys.public_key().as_hex().bright_yellow());
    println!("  Stored in:  {}", config.keys_path()?.display().to_string().bright_cyan());
    Ok(())
}

fn cmd_uuid(owner: &str, name: &str) -> Result<()> {
    let identity = identity_of(owner, name).context("Invalid stream identity")?;
    println!("{}", identity.uuid());
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} {} = {}", "✓".green(), key, value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:<22} {}", key, value.bright_cyan());
            }
        }
        ConfigAction::AddRelay { url } => {
            if config.add_relay(&url)? {
                config.save()?;
                println!("{} Added relay {}", "✓".green(), url);
            } else {
                println!("{}", "Relay already configured.".dimmed());
            }
        }
        ConfigAction::RemoveRelay { url } => {
            if config.remove_relay(&url) {
                config.save()?;
                println!("{} Removed relay {}", "✓".green(), url);
            } else {
                println!("{}", "Relay not configured.".dimmed());
            }
        }
    }
    Ok(())
}

async fn cmd_relays(operator: Option<String>) -> Result<()> {
    let config = config::Config::load()?;
    let operator = operator
        .map(|key| PublicKey::from_hex(&key))
        .transpose()
        .context("Invalid operator key")?;
    let coordinator = coordinator(&config)?;

    let connected = coordinator.connect().await.unwrap_or(0);
    println!(
        "{} ({} of {} reachable)",
        "Relays".bold(),
        connected,
        coordinator.all_relay_status().len()
    );

    for status in coordinator.all_relay_status() {
        let state = match status.state {
            RelayState::Healthy => "healthy".green(),
            RelayState::Degraded => "degraded".yellow(),
            RelayState::CircuitOpen => "circuit open".red(),
        };
        println!("  {:<40} {}", status.url, state);

        if let Some(operator) = &operator {
            match fetch_relay_information(&status.url).await {
                Ok(info) => {
                    let verdict = verify_relay_identity(&info, operator);
                    if verdict.is_verified() {
                        println!("    {} operator verified", "✓".green());
                    } else {
                        println!("    {} unverified: {:?}", "!".yellow(), verdict);
                    }
                }
                Err(e) => println!("    {} {}", "!".yellow(), e),
            }
        }
    }

    coordinator.shutdown().await;
    Ok(())
}

async fn cmd_discover(tags: Vec<String>, active_only: bool) -> Result<()> {
    let config = config::Config::load()?;
    let keys = Arc::new(load_keys(&config)?);
    let coordinator = coordinator(&config)?;
    coordinator.connect().await.context("No relay reachable")?;

    let subscriber = DatastreamSubscriber::from_config(keys, coordinator.clone(), &config.client)?;
    let streams = subscriber.discover(&tags, active_only).await?;

    if streams.is_empty() {
        println!("{}", "No streams found.".dimmed());
    } else {
        println!("{} ({} found)", "Streams".bold(), streams.len());
        let now = datastream_core::now_unix();
        for meta in &streams {
            let last = coordinator
                .latest_observation_at(&meta.identity)
                .await
                .ok()
                .flatten();
            let health = datastream_core::monitor::classify(meta.cadence_seconds, last, now);
            let price = if meta.is_free() {
                "free".to_string()
            } else {
                format!("{} sats/obs", meta.price_per_obs)
            };
            println!(
                "  {:<24} {}  {}  {}",
                meta.display_name.bright_cyan(),
                price,
                health_label(health),
                meta.identity.uuid().to_string().dimmed()
            );
            println!("    owner {}", meta.identity.owner().as_hex());
        }
    }

    subscriber.stop().await;
    Ok(())
}

async fn cmd_monitor(owner: &str, name: &str, interval: Option<u64>) -> Result<()> {
    let mut config = config::Config::load()?;
    if let Some(interval) = interval {
        config.client.monitor.check_interval_secs = interval;
    }
    let identity = identity_of(owner, name).context("Invalid stream identity")?;
    let keys = Arc::new(load_keys(&config)?);
    let coordinator = coordinator(&config)?;
    coordinator.connect().await.context("No relay reachable")?;
    coordinator.start();

    let subscriber = DatastreamSubscriber::from_config(keys, coordinator.clone(), &config.client)?;
    let meta = subscriber.fetch_announcement(&identity).await?;

    let monitor = subscriber.monitor().clone();
    let mut alerts = monitor.subscribe_alerts();
    let health = monitor.add_stream(&meta).await.unwrap_or(StreamHealth::Unknown);
    monitor.start()?;

    println!(
        "{} {} ({}), press Ctrl-C to stop",
        "Monitoring".bold(),
        meta.display_name.bright_cyan(),
        health_label(health)
    );

    loop {
        tokio::select! {
            alert = alerts.recv() => {
                let alert = match alert {
                    Ok(alert) => alert,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let marker = match alert.kind {
                    AlertKind::BecameActive => "▲".green(),
                    AlertKind::BecameStale => "▼".yellow(),
                    AlertKind::BecameDead => "✗".red(),
                };
                println!(
                    "  {} {:?} -> {}  (last observation {})",
                    marker,
                    alert.from,
                    health_label(alert.to),
                    alert.last_observation_at.map_or_else(|| "never".to_string(), |t| t.to_string())
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    subscriber.stop().await;
    Ok(())
}

async fn cmd_subscribe(owner: &str, name: &str) -> Result<()> {
    let config = config::Config::load()?;
    let identity = identity_of(owner, name).context("Invalid stream identity")?;
    let keys = Arc::new(load_keys(&config)?);
    let coordinator = coordinator(&config)?;

    let subscriber = Arc::new(DatastreamSubscriber::from_config(
        keys,
        coordinator,
        &config.client,
    )?);
    let mut observations = subscriber
        .observations()
        .context("Observation channel already taken")?;
    subscriber.start().await?;
    let meta = subscriber.subscribe(&identity).await?;

    println!(
        "{} {} ({}), press Ctrl-C to stop",
        "Subscribed to".bold(),
        meta.display_name.bright_cyan(),
        if meta.is_free() {
            "free".to_string()
        } else {
            format!("{} sats/obs", meta.price_per_obs)
        }
    );

    loop {
        tokio::select! {
            received = observations.recv() => {
                let Some(received) = received else { break };
                println!(
                    "  #{:<6} {}  {}",
                    received.observation.seq_num,
                    received.observation.timestamp.to_string().dimmed(),
                    received.observation.value
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(e) = subscriber.unsubscribe(&identity).await {
        eprintln!("{} Could not unsubscribe: {}", "!".yellow(), e);
    }
    subscriber.stop().await;
    Ok(())
}
