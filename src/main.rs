//! WolfCoord - Leader Election and Service Registry
//!
//! Runs the coordination store server, or a cluster node that takes part in
//! leader election and publishes itself to the service registry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfcoord::api::HttpServer;
use wolfcoord::config::{LoggingConfig, WolfCoordConfig};
use wolfcoord::error::{Error, Result};
use wolfcoord::node::ClusterNode;
use wolfcoord::store::{MemoryStore, StoreServer};

/// WolfCoord - Leader Election and Service Registry
#[derive(Parser)]
#[command(name = "wolfcoord")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfcoord.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordination store server
    Serve {
        /// Address to listen on (defaults to server.bind_address)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Start a cluster node
    Start,

    /// Show a node's election status
    Status {
        /// Node API address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// List live cluster members as seen by a node
    Members {
        /// Node API address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfcoord.toml")]
        output: PathBuf,

        /// Node ID (generated if omitted)
        #[arg(long)]
        node_id: Option<String>,

        /// Address published to the service registry
        #[arg(long, default_value = "127.0.0.1:9000")]
        advertise_address: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let file_logging = WolfCoordConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or(file_logging.level.clone());
    init_logging(&level, &file_logging);

    match cli.command {
        Commands::Serve { listen } => {
            run_serve(cli.config, listen).await
        }
        Commands::Start => {
            run_start(cli.config).await
        }
        Commands::Status { address } => {
            run_query(&address, "/status").await
        }
        Commands::Members { address } => {
            run_query(&address, "/cluster/members").await
        }
        Commands::Init { output, node_id, advertise_address } => {
            run_init(output, node_id, advertise_address)
        }
        Commands::Validate => {
            run_validate(cli.config)
        }
        Commands::Info => {
            run_info(cli.config)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Run the coordination store server
async fn run_serve(config_path: PathBuf, listen: Option<String>) -> Result<()> {
    let bind_address = match listen {
        Some(address) => address,
        None => match WolfCoordConfig::from_file(&config_path) {
            Ok(config) => config.server.bind_address,
            Err(_) => wolfcoord::config::ServerConfig::default().bind_address,
        },
    };

    tracing::info!("Starting WolfCoord store server");
    let server = Arc::new(StoreServer::new(bind_address, MemoryStore::new()));

    let serving = Arc::clone(&server);
    let server_handle = tokio::spawn(async move { serving.start().await });

    tokio::select! {
        result = server_handle => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Store server error: {}", e);
                    return Err(e);
                }
                Err(e) => return Err(Error::Internal(format!("store server task failed: {}", e))),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            server.stop();
        }
    }

    tracing::info!("WolfCoord store server shutdown complete");
    Ok(())
}

/// Start a cluster node and keep it in the cluster
async fn run_start(config_path: PathBuf) -> Result<()> {
    let config = WolfCoordConfig::from_file(&config_path)?;

    tracing::info!("Starting WolfCoord node {}", config.node.id);
    tracing::info!("Advertise address: {}", config.node.advertise_address);

    let http_server = Arc::new(HttpServer::new(config.api.clone(), config.node.id.clone()));
    let http_handle = if config.api.enabled {
        let server = Arc::clone(&http_server);
        Some(tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("HTTP API error: {}", e);
            }
        }))
    } else {
        None
    };

    let mut last_error = None;
    loop {
        let joined = tokio::select! {
            result = ClusterNode::start(&config) => result,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        };

        match joined {
            Ok(node) => {
                last_error = None;
                http_server.set_node(Some(Arc::clone(&node))).await;

                let outcome = tokio::select! {
                    result = node.run() => Some(result),
                    _ = tokio::signal::ctrl_c() => None,
                };
                http_server.set_node(None).await;

                match outcome {
                    None => {
                        tracing::info!("Received shutdown signal");
                        if let Err(e) = node.close().await {
                            tracing::warn!("Failed to close session: {}", e);
                        }
                        break;
                    }
                    Some(Ok(reason)) => {
                        tracing::warn!("Session ended: {:?}", reason);
                    }
                    Some(Err(e)) => {
                        tracing::error!("Session failed: {}", e);
                        last_error = Some(e);
                    }
                }
            }
            Err(e) => {
                tracing::error!("Failed to join cluster: {}", e);
                last_error = Some(e);
            }
        }

        if !config.node.rejoin {
            break;
        }

        let delay = jittered(config.rejoin_delay());
        tracing::info!("Rejoining cluster in {} ms", delay.as_millis());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    if let Some(handle) = http_handle {
        handle.abort();
    }

    tracing::info!("WolfCoord shutdown complete");
    match last_error {
        Some(e) if !config.node.rejoin => Err(e),
        _ => Ok(()),
    }
}

/// Base delay plus up to half of it again
fn jittered(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 2;
    let extra = rand::thread_rng().gen_range(0..=spread);
    base + Duration::from_millis(extra)
}

/// Fetch a JSON document from a node's HTTP API and print it
async fn run_query(address: &str, path: &str) -> Result<()> {
    let url = format!("http://{}{}", address, path);

    match reqwest::get(&url).await {
        Ok(response) => {
            let body: serde_json::Value = response.json().await
                .map_err(|e| Error::Network(e.to_string()))?;
            let pretty = serde_json::to_string_pretty(&body)
                .map_err(|e| Error::Internal(e.to_string()))?;
            println!("{}", pretty);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to query {}: {}", url, e);
            Err(Error::Network(e.to_string()))
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: Option<String>, advertise_address: String) -> Result<()> {
    let node_id = node_id.unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("node-{}", &id[..8])
    });

    let config_content = format!(r#"# WolfCoord Configuration
# Generated configuration file

[node]
id = "{node_id}"
advertise_address = "{advertise_address}"
rejoin = true
rejoin_delay_ms = 1000

[store]
address = "127.0.0.1:2181"
session_timeout_ms = 3000
connect_timeout_ms = 5000

[election]
root = "/election"
prefix = "c_"

[registry]
root = "/service_registry"
prefix = "n_"

[server]
bind_address = "0.0.0.0:2181"

[api]
enabled = true
bind_address = "0.0.0.0:8080"
cors_enabled = false

[logging]
level = "info"
format = "full"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nStart a store with: wolfcoord serve --config {}", output.display());
    println!("Then start nodes with: wolfcoord start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfCoordConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Advertise Address: {}", config.node.advertise_address);
            println!("  Store: {}", config.store.address);
            println!("  Election Root: {}", config.election.root);
            println!("  Registry Root: {}", config.registry.root);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfCoordConfig::from_file(&config_path)?;

    println!("WolfCoord Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Advertise:        {}", config.node.advertise_address);
    println!("Rejoin:           {} (base delay {} ms)", config.node.rejoin, config.node.rejoin_delay_ms);
    println!();
    println!("Coordination Store:");
    println!("  Address:        {}", config.store.address);
    println!("  Session:        {} ms", config.store.session_timeout_ms);
    println!("  Connect:        {} ms", config.store.connect_timeout_ms);
    println!();
    println!("Paths:");
    println!("  Election:       {}/{}*", config.election.root, config.election.prefix);
    println!("  Registry:       {}/{}*", config.registry.root, config.registry.prefix);
    println!();
    println!("API:");
    println!("  Enabled:        {}", config.api.enabled);
    println!("  Bind Address:   {}", config.api.bind_address);

    Ok(())
}
