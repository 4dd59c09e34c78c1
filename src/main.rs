//! Leasehold - Single-Writer Database Coordination
//!
//! Runs the coordinator or a participating process, and talks to running
//! nodes over their HTTP API.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use leasehold::api::{ApiClient, AppState, HttpServer};
use leasehold::config::LeaseholdConfig;
use leasehold::coordinator::Coordinator;
use leasehold::error::{Error, Result};
use leasehold::liveness;
use leasehold::network::{self, NetworkServer};
use leasehold::proxy::{ClientProxy, ProxyEvent};
use leasehold::store::{SqliteStore, Store};

/// Leasehold - Single-Writer Database Coordination
#[derive(Parser)]
#[command(name = "leasehold")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "leasehold.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator
    Start,

    /// Run one participating process
    Process {
        /// Process ID (generated if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Coordinator address (defaults to coordinator.bind_address)
        #[arg(long)]
        coordinator: Option<String>,

        /// HTTP API address for this process (defaults to api.bind_address)
        #[arg(long)]
        api_address: Option<String>,
    },

    /// Show a node's status
    Status {
        /// Node HTTP API address
        #[arg(short, long, default_value = "127.0.0.1:7780")]
        address: String,
    },

    /// Run a statement through a process node
    Query {
        /// Process node HTTP API address
        #[arg(short, long, default_value = "127.0.0.1:7780")]
        address: String,

        /// Statement to execute
        statement: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "leasehold.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| load_config(&cli.config).ok().map(|c| c.logging.level))
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    match cli.command {
        Commands::Start => run_start(&cli.config).await,
        Commands::Process {
            id,
            coordinator,
            api_address,
        } => run_process(&cli.config, id, coordinator, api_address).await,
        Commands::Status { address } => run_status(&address).await,
        Commands::Query { address, statement } => run_query(&address, &statement).await,
        Commands::Init { output } => run_init(&output),
        Commands::Validate => run_validate(&cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the configuration file, falling back to defaults if it is missing
fn load_config(path: &Path) -> Result<LeaseholdConfig> {
    if path.exists() {
        LeaseholdConfig::from_file(path)
    } else {
        tracing::debug!("No configuration at {:?}; using defaults", path);
        Ok(LeaseholdConfig::default())
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Internal(format!("cannot render response: {}", e)))?;
    println!("{}", rendered);
    Ok(())
}

/// Run the coordinator until Ctrl+C
async fn run_start(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    tracing::info!("Starting coordinator on {}", config.coordinator.bind_address);

    let coordinator = Coordinator::spawn(config.coordinator.clone());
    let server = Arc::new(NetworkServer::new(
        config.coordinator.bind_address.clone(),
        coordinator.clone(),
    ));
    let listener = server.bind().await?;

    let serving = server.clone();
    let server_task = tokio::spawn(async move { serving.serve(listener).await });

    if config.api.enabled {
        let api = HttpServer::new(
            config.api.clone(),
            AppState {
                coordinator: Some(coordinator.clone()),
                proxy: None,
            },
        );
        tokio::spawn(async move {
            if let Err(e) = api.start().await {
                tracing::error!("HTTP API failed: {}", e);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    server.stop();
    coordinator.shutdown();
    let _ = server_task.await;
    Ok(())
}

/// Run one process until Ctrl+C or until the coordinator goes away
async fn run_process(
    config_path: &Path,
    id: Option<String>,
    coordinator: Option<String>,
    api_address: Option<String>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(address) = api_address {
        config.api.bind_address = address;
    }
    let address = coordinator.unwrap_or_else(|| config.coordinator.bind_address.clone());

    let channel = network::connect(&address, config.coordinator.connect_timeout()).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(config.store.clone()));
    let signal = liveness::from_config(&config.liveness);

    let proxy = Arc::new(match id {
        Some(id) => ClientProxy::start(id, channel, store, signal),
        None => ClientProxy::start_anonymous(channel, store, signal),
    });
    let mut events = proxy.subscribe();
    proxy.register_self().await?;
    tracing::info!("Process {} joined coordinator {}", proxy.process_id(), address);

    if config.api.enabled {
        let api = HttpServer::new(
            config.api.clone(),
            AppState {
                coordinator: None,
                proxy: Some(proxy.clone()),
            },
        );
        tokio::spawn(async move {
            if let Err(e) = api.start().await {
                tracing::error!("HTTP API failed: {}", e);
            }
        });
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Received shutdown signal");
                break;
            }
            event = events.recv() => match event {
                Ok(ProxyEvent::Disconnected) => {
                    tracing::error!("Lost connection to coordinator {}", address);
                    break;
                }
                Ok(event) => tracing::debug!("Proxy event: {:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Skipped {} proxy events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    proxy.shutdown().await;
    Ok(())
}

/// Print a node's status
async fn run_status(address: &str) -> Result<()> {
    let client = ApiClient::new(address, Duration::from_secs(10))?;
    match client.status().await {
        Ok(status) => print_json(&status),
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(e)
        }
    }
}

/// Run one statement through a process node
async fn run_query(address: &str, statement: &str) -> Result<()> {
    let client = ApiClient::new(address, Duration::from_secs(60))?;
    match client.query(statement).await {
        Ok(response) => print_json(&response),
        Err(e) => {
            eprintln!("Query failed: {}", e);
            Err(e)
        }
    }
}

/// Initialize configuration file
fn run_init(output: &Path) -> Result<()> {
    let rendered = LeaseholdConfig::default().to_toml()?;
    let content = format!("# Leasehold Configuration\n# Generated configuration file\n\n{}", rendered);

    std::fs::write(output, content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nStart the coordinator with: leasehold --config {} start", output.display());
    println!("Then start processes with:  leasehold --config {} process", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> Result<()> {
    match LeaseholdConfig::from_file(config_path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  Coordinator: {}", config.coordinator.bind_address);
            println!(
                "  Heartbeat: every {} ms, timeout {} ms",
                config.coordinator.heartbeat_interval_ms, config.coordinator.heartbeat_timeout_ms
            );
            println!("  Store: {}", config.store.path.display());
            println!("  Liveness: {:?}", config.liveness.backend);
            println!(
                "  HTTP API: {}",
                if config.api.enabled { config.api.bind_address.as_str() } else { "disabled" }
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration is invalid: {}", e);
            Err(e)
        }
    }
}
