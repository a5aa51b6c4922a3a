//! MeshMQ - Clustered message broker
//!
//! Usage:
//!   meshmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path
//!   -b, --cluster-bind <ADDR> Cluster listener bind address
//!   -n, --node-id <ID>       Node identifier
//!   -l, --log-level          Log level (error, warn, info, debug, trace)
//!   -h, --help               Print help

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use meshmq::broker::BrokerNode;
use meshmq::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// MeshMQ - Clustered message broker
#[derive(Parser, Debug)]
#[command(name = "meshmq")]
#[command(version = "0.1.0")]
#[command(about = "Clustered message broker with multicast discovery")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cluster listener bind address
    #[arg(short = 'b', long)]
    cluster_bind: Option<SocketAddr>,

    /// Node identifier (default: hostname)
    #[arg(short, long)]
    node_id: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let mut config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // Setup logging - CLI overrides config, config overrides default
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    if let Some(bind) = args.cluster_bind {
        config.node.cluster_bind = bind;
    }
    if let Some(node_id) = args.node_id {
        config.node.id = Some(node_id);
    }

    info!("Starting MeshMQ");
    info!("  Cluster bind: {}", config.node.cluster_bind);
    info!("  Broadcast groups: {}", config.broadcast_group.len());
    info!("  Discovery groups: {}", config.discovery_group.len());
    info!(
        "  Cluster connections: {}",
        config.cluster_connection.len()
    );
    for connection in &config.cluster_connection {
        info!(
            "    - '{}' forwarding '{}' (max_hops={}, window={} bytes)",
            connection.name,
            connection.address,
            connection.max_hops,
            connection.confirmation_window_size
        );
    }

    let node = match BrokerNode::new(config) {
        Ok(node) => node,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    node.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    node.stop().await;

    Ok(())
}
