//! Research Relay Daemon
//!
//! Standalone server process for the research streaming orchestrator.
//! Client surfaces connect over WebSocket and exchange `{"event", "data"}`
//! JSON messages.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:8765, agent at http://localhost:8001)
//! relay-daemon
//!
//! # Persist to SQLite
//! relay-daemon --storage sqlite --sqlite-path /var/lib/research-relay/relay.db
//!
//! # Only probe the research agent
//! relay-daemon --check-agent
//!
//! # With verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Environment Variables
//!
//! - `RELAY_CONFIG`: Path to the TOML configuration file
//! - `RESEARCH_AGENT_URL` / `PYTHON_AGENT_URL`: Research agent base URL
//! - `RELAY_BIND_ADDRESS`, `RELAY_STALL_TIMEOUT`, `RELAY_OUTBOUND_CAPACITY`,
//!   `RELAY_STORAGE`, `RELAY_SQLITE_PATH`: See the configuration module
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)
//!
//! # Signals
//!
//! - SIGTERM/SIGINT: Graceful shutdown (in-flight queries are cancelled)

mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use relay_core::config::{default_config_path, load_config_from_path};
use relay_core::{
    ConfigOverrides, HttpResearchAgent, MemoryStore, PersistenceCoordinator, RelayConfigFile,
    RelayContext, ResearchAgent, SqliteStore, StorageBackend, StreamRelay, TurnStore,
};

use crate::server::{RelayServer, ServerConfig};

/// Research relay daemon
#[derive(Debug, Parser)]
#[command(name = "relay-daemon", version, about)]
struct Args {
    /// Configuration file (default: $XDG_CONFIG_HOME/research-relay/relay.toml)
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8765
    #[arg(long)]
    bind: Option<String>,

    /// Research agent base URL
    #[arg(long)]
    agent_url: Option<String>,

    /// Storage backend: memory or sqlite
    #[arg(long)]
    storage: Option<String>,

    /// SQLite database file
    #[arg(long)]
    sqlite_path: Option<PathBuf>,

    /// Probe the research agent and exit
    #[arg(long)]
    check_agent: bool,
}

impl Args {
    fn overrides(&self) -> anyhow::Result<ConfigOverrides> {
        let mut overrides = ConfigOverrides::new();
        if let Some(addr) = &self.bind {
            overrides = overrides.with_bind_address(addr.clone());
        }
        if let Some(url) = &self.agent_url {
            overrides = overrides.with_agent_url(url.clone());
        }
        if let Some(storage) = &self.storage {
            overrides = overrides.with_storage(storage.parse::<StorageBackend>()?);
        }
        if let Some(path) = &self.sqlite_path {
            overrides = overrides.with_sqlite_path(path.clone());
        }
        Ok(overrides)
    }
}

fn load(args: &Args) -> anyhow::Result<RelayConfigFile> {
    if let Some(path) = &args.config {
        if !path.exists() {
            bail!("Config file {} does not exist", path.display());
        }
    }
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path.as_deref()).context("Failed to load configuration")?;
    args.overrides()?
        .apply(&mut config)
        .context("Invalid command-line option")?;
    Ok(config)
}

async fn open_store(config: &RelayConfigFile) -> anyhow::Result<Arc<dyn TurnStore>> {
    let store: Arc<dyn TurnStore> = match config.storage {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; conversations are lost on restart");
            Arc::new(MemoryStore::new())
        }
        StorageBackend::Sqlite => Arc::new(
            SqliteStore::connect(&config.sqlite_path)
                .await
                .with_context(|| {
                    format!("Failed to open SQLite store at {}", config.sqlite_path.display())
                })?,
        ),
    };
    Ok(store)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_daemon=info".parse()?)
                .add_directive("relay_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let args = Args::parse();
    let config = load(&args)?;

    info!(
        source = %config.source(),
        file = ?config.config_file_path,
        agent_url = %config.agent_url,
        storage = %config.storage,
        "Starting research relay daemon"
    );

    let agent = Arc::new(
        HttpResearchAgent::new(&config.agent_url, config.connect_timeout)
            .context("Failed to create HTTP client")?,
    );

    let healthy = agent.health_check().await;
    if healthy {
        info!(agent_url = %config.agent_url, "Research agent is healthy");
    } else {
        warn!(agent_url = %config.agent_url, "Research agent health check failed");
    }
    if args.check_agent {
        if !healthy {
            bail!("Research agent at {} is not healthy", config.agent_url);
        }
        return Ok(());
    }

    let store = open_store(&config).await?;
    let context = RelayContext {
        relay: Arc::new(StreamRelay::new(agent, config.relay_settings())),
        persistence: PersistenceCoordinator::new(store),
        settings: config.connection_settings(),
    };

    let server = RelayServer::new(
        ServerConfig {
            bind_address: config.bind_address.clone(),
            max_connections: config.max_connections,
            max_message_size: config.max_message_size,
        },
        context,
    );
    let listener = server.bind().await?;
    server.run(listener, shutdown_signal()).await?;

    info!("Research relay daemon stopped cleanly");
    Ok(())
}
