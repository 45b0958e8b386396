//! Pylon broker (relay server)
//!
//! This binary runs the public-facing broker: a TCP listener for public
//! traffic and a WebSocket listener for agent tunnels, wired together by a
//! shared routing directory and pending-exchange table.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pylon_control::{AgentListener, PendingExchanges, TunnelHandler};
use pylon_directory::AgentDirectory;
use pylon_server_http::{PublicServer, PublicServerConfig};
use pylon_store::SsdbStore;

/// Pylon broker - accepts public connections and routes them to agents
#[derive(Parser, Debug)]
#[command(name = "pylon")]
#[command(about = "Run a reverse tunnel broker", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Public HTTP bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    http_addr: String,

    /// Agent tunnel bind address (WebSocket)
    #[arg(long, default_value = "0.0.0.0:9000")]
    agent_addr: String,

    /// SSDB credential store address
    #[arg(long, env = "PYLON_STORE_ADDR", default_value = "127.0.0.1:8888")]
    store_addr: String,

    /// Domain mappings fetched per agent at registration
    #[arg(long, default_value = "5")]
    domain_limit: u64,

    /// Seconds one public request may wait for its agent reply
    #[arg(long, default_value = "30")]
    exchange_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_logging(&args.log_level)?;

    info!("🚀 Starting pylon broker");
    info!("Public endpoint: {}", args.http_addr);
    info!("Agent tunnel endpoint: {}", args.agent_addr);
    info!("Credential store: {}", args.store_addr);

    let directory = Arc::new(AgentDirectory::new());
    let pending = Arc::new(PendingExchanges::new());
    let store = Arc::new(SsdbStore::new(args.store_addr.clone()));
    info!("✅ Routing directory initialized");

    let handler = Arc::new(
        TunnelHandler::new(directory.clone(), store, pending.clone())
            .with_domain_limit(args.domain_limit),
    );

    let agent_addr: SocketAddr = args.agent_addr.parse()?;
    let agent_listener = AgentListener::bind(agent_addr, handler).await?;
    let agent_handle = tokio::spawn(async move {
        agent_listener.run().await;
    });
    info!("✅ Agent listener started");

    let http_addr: SocketAddr = args.http_addr.parse()?;
    let public_config = PublicServerConfig {
        bind_addr: http_addr,
        exchange_timeout: Duration::from_secs(args.exchange_timeout_secs),
    };
    let public_server = PublicServer::bind(public_config, directory.clone(), pending.clone()).await?;
    let public_handle = tokio::spawn(async move {
        public_server.run().await;
    });
    info!("✅ Public server started");

    info!("✅ Pylon broker is running");
    info!("Ready to accept incoming connections");
    info!("  - Public traffic: {}", args.http_addr);
    info!("  - Agent tunnels: ws://{}", args.agent_addr);
    info!("Press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping servers...");
        }
        Err(err) => {
            error!("Error listening for shutdown signal: {}", err);
        }
    }

    agent_handle.abort();
    public_handle.abort();
    info!("✅ Pylon broker stopped");

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
