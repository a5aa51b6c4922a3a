//! Configuration Module
//!
//! Provides TOML-based configuration for MeshMQ with support for:
//! - Node identity and the cluster listener
//! - Named connectors advertised to peers
//! - Broadcast and discovery groups
//! - Cluster connections
//! - Environment variable overrides (MESHMQ_* prefix)
//!
//! Every section is validated eagerly at load time; an invalid
//! configuration is rejected before any task starts.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::transport::ConnectorPair;

// Re-export cluster config types
pub use cluster::{BroadcastGroupConfig, ClusterConnectionConfig, DiscoveryGroupConfig};

mod cluster;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Node identity and listener configuration
    pub node: NodeConfig,
    /// Broadcast group configurations
    pub broadcast_group: Vec<BroadcastGroupConfig>,
    /// Discovery group configurations
    pub discovery_group: Vec<DiscoveryGroupConfig>,
    /// Cluster connection configurations
    pub cluster_connection: Vec<ClusterConnectionConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Node identity and cluster listener
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node identifier (auto-generated from hostname if not set)
    pub id: Option<String>,

    /// Address the cluster acceptor binds to
    pub cluster_bind: SocketAddr,

    /// Named connectors peers can reach this node at
    pub connector: HashMap<String, ConnectorConfig>,
}

fn default_cluster_bind() -> SocketAddr {
    "0.0.0.0:61616".parse().unwrap()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            cluster_bind: default_cluster_bind(),
            connector: HashMap::new(),
        }
    }
}

impl NodeConfig {
    /// Get the node ID, generating from hostname if not set
    pub fn get_node_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| format!("node-{}", rand_id()))
        })
    }
}

/// A named connector description
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Primary acceptor address
    pub address: String,
    /// Backup acceptor address
    #[serde(default)]
    pub backup: Option<String>,
}

impl ConnectorConfig {
    /// Parse into a connector pair
    pub fn to_pair(&self) -> Result<ConnectorPair, ConfigError> {
        let address = self
            .address
            .parse()
            .map_err(|_| ConfigError::Validation(format!("invalid address '{}'", self.address)))?;
        let backup = match &self.backup {
            Some(backup) => Some(backup.parse().map_err(|_| {
                ConfigError::Validation(format!("invalid backup address '{}'", backup))
            })?),
            None => None,
        };
        Ok(ConnectorPair { address, backup })
    }
}

/// Generate a random ID for node identification
fn rand_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:x}", nanos & 0xFFFFFFFF)
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MESHMQ__` prefix with double underscores for nesting:
    ///    - `MESHMQ__NODE__CLUSTER_BIND=0.0.0.0:61617` overrides `node.cluster_bind`
    ///    - `MESHMQ__LOG__LEVEL=debug` overrides `log.level`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("node.cluster_bind", "0.0.0.0:61616")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MESHMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section and all cross-references
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, connector) in &self.node.connector {
            connector.to_pair().map_err(|e| {
                ConfigError::Validation(format!("connector '{}': {}", name, e))
            })?;
        }

        let mut discovery_names = HashSet::new();
        for group in &self.discovery_group {
            group.validate()?;
            if !discovery_names.insert(&group.name) {
                return Err(ConfigError::Validation(format!(
                    "duplicate discovery group name '{}'",
                    group.name
                )));
            }
        }

        let mut broadcast_names = HashSet::new();
        for group in &self.broadcast_group {
            group.validate()?;
            if !broadcast_names.insert(&group.name) {
                return Err(ConfigError::Validation(format!(
                    "duplicate broadcast group name '{}'",
                    group.name
                )));
            }
            for connector in &group.connector_names {
                if !self.node.connector.contains_key(connector) {
                    return Err(ConfigError::Validation(format!(
                        "broadcast group '{}' advertises unknown connector '{}'",
                        group.name, connector
                    )));
                }
            }
        }

        let mut connection_names = HashSet::new();
        for connection in &self.cluster_connection {
            connection.validate()?;
            if !connection_names.insert(&connection.name) {
                return Err(ConfigError::Validation(format!(
                    "duplicate cluster connection name '{}'",
                    connection.name
                )));
            }
            if !self.node.connector.contains_key(&connection.connector_name) {
                return Err(ConfigError::Validation(format!(
                    "cluster connection '{}' references unknown connector '{}'",
                    connection.name, connection.connector_name
                )));
            }
            if let Some(group) = &connection.discovery_group {
                if !discovery_names.contains(group) {
                    return Err(ConfigError::Validation(format!(
                        "cluster connection '{}' references unknown discovery group '{}'",
                        connection.name, group
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve a named connector into a connector pair
    pub fn connector_pair(&self, name: &str) -> Option<ConnectorPair> {
        self.node
            .connector
            .get(name)
            .and_then(|c| c.to_pair().ok())
    }
}
