//! MeshSync - Peer-to-Peer Eventual Consistency Engine
//!
//! Runs one sync node: captures local changes into the ledger, serves
//! the sync API, and exchanges changes and files with every configured
//! peer until the fleet converges.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshsync::api::HttpServer;
use meshsync::config::MeshSyncConfig;
use meshsync::engine::SyncEngine;
use meshsync::error::Result;

/// MeshSync - Peer-to-Peer Eventual Consistency Engine
#[derive(Parser)]
#[command(name = "meshsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "meshsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MeshSync node
    Start,

    /// Query a running node's status
    Status {
        /// Node address to query
        #[arg(short, long, default_value = "localhost:7655")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "meshsync.toml")]
        output: PathBuf,

        /// Server ID for this node
        #[arg(long, default_value = "server-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
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

/// Start the MeshSync node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting MeshSync node...");

    let config = match MeshSyncConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!(
            "Failed to create data directory {:?}: {}",
            config.data_dir(),
            e
        );
        return Err(e.into());
    }
    if let Err(e) = std::fs::create_dir_all(config.state_dir()) {
        tracing::error!(
            "Failed to create state directory {:?}: {}",
            config.state_dir(),
            e
        );
        return Err(e.into());
    }

    let api_config = config.api.clone();
    let engine = SyncEngine::new(config).await?;
    if engine.is_degraded() {
        tracing::warn!("node is degraded: serving sync reads, refusing incoming pushes");
    }
    tracing::info!(
        "Engine ready: server {} with {} change(s) in the ledger",
        engine.server_id(),
        engine.ledger().count().await?
    );

    let handles = engine.start().await?;
    let http_server = HttpServer::new(api_config, Arc::clone(&engine));

    tokio::select! {
        result = http_server.start(engine.shutdown_signal()) => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    engine.shutdown();
    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("MeshSync shutdown complete");
    Ok(())
}

/// Query a running node's status
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/sync/status", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response
                .json()
                .await
                .map_err(|e| meshsync::error::Error::Network(e.to_string()))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .map_err(meshsync::error::Error::Serialization)?
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(meshsync::error::Error::Network(e.to_string()))
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = MeshSyncConfig::generate_default(&node_id);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set your peers and data directory.");
    println!("Then start with: meshsync start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match MeshSyncConfig::from_file(&config_path) {
        Ok(config) => {
            let (peers, malformed) = config.peer_urls();
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Data Directory: {}", config.data_dir().display());
            println!("  Database: {}", config.database.path.display());
            println!("  API: {}", config.api.bind_address);
            println!("  Peers: {}", peers.len());
            for url in &malformed {
                println!("  ! Malformed peer URL: {:?}", url);
            }
            println!(
                "  File Replication: {}",
                if config.files.enabled { "enabled" } else { "disabled" }
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node configuration
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = MeshSyncConfig::from_file(&config_path)?;
    let (peers, _) = config.peer_urls();

    println!("MeshSync Node Information");
    println!("=========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Data Directory:   {}", config.data_dir().display());
    println!("API Address:      {}", config.api.bind_address);
    println!();
    println!("Database:");
    println!("  Path:           {}", config.database.path.display());
    println!("  Pool Size:      {}", config.database.pool_size);
    println!("  Key Column:     {}", config.database.key_column);
    println!();
    println!("Sync:");
    println!("  Enabled:        {}", config.sync.enabled);
    println!("  Peers:          {:?}", peers);
    println!("  Interval:       {} s", config.sync.interval_secs);
    println!("  Catch-up Every: {} s", config.sync.catchup_interval_secs);
    println!("  Max Batch:      {}", config.sync.max_batch);
    println!("  Workers:        {}", config.sync.dispatch_workers);
    println!();
    println!("Files:");
    println!("  Enabled:        {}", config.files.enabled);
    println!("  Root:           {}", config.files.root.display());
    println!("  Interval:       {} s", config.files.interval_secs);
    println!("  Max Size:       {} MB", config.files.max_file_mb);

    Ok(())
}
