//! Cluster Configuration
//!
//! Configuration types for cluster connections, discovery groups, and
//! broadcast groups. All values are validated eagerly; an invalid
//! combination is rejected before anything starts.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Configuration for one cluster connection: the forwarding
/// relationship between this broker and a group of peers for one
/// address.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConnectionConfig {
    /// Cluster connection name
    pub name: String,

    /// Address whose messages this connection forwards
    pub address: String,

    /// Named local connector advertised to peers for the return path
    pub connector_name: String,

    /// Delay before the first bridge reconnect attempt
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Ceiling for the exponential reconnect backoff
    #[serde(with = "humantime_serde")]
    pub max_retry_interval: Duration,

    /// Stamp forwarded messages with duplicate-detection identifiers
    pub duplicate_detection: bool,

    /// Forward even when the peer reports no consumers for the address
    pub forward_when_no_consumers: bool,

    /// Maximum inter-broker forwards a message or topology fact may
    /// traverse
    pub max_hops: u32,

    /// Maximum unconfirmed forwarded bytes in flight per bridge
    pub confirmation_window_size: u64,

    /// Identifiers retained per address by the duplicate filter
    pub duplicate_cache_size: usize,

    /// Discovery group supplying peers
    pub discovery_group: Option<String>,

    /// Fixed peer connectors, used instead of discovery
    pub static_connectors: Vec<String>,
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_max_retry_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_confirmation_window_size() -> u64 {
    1024 * 1024
}

fn default_duplicate_cache_size() -> usize {
    2048
}

impl Default for ClusterConnectionConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: String::new(),
            connector_name: String::new(),
            retry_interval: default_retry_interval(),
            max_retry_interval: default_max_retry_interval(),
            duplicate_detection: true,
            forward_when_no_consumers: false,
            max_hops: 1,
            confirmation_window_size: default_confirmation_window_size(),
            duplicate_cache_size: default_duplicate_cache_size(),
            discovery_group: None,
            static_connectors: Vec::new(),
        }
    }
}

impl ClusterConnectionConfig {
    /// Reject invalid combinations before any task starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation(
                "cluster connection name must not be empty".to_string(),
            ));
        }
        if self.address.is_empty() {
            return Err(ConfigError::Validation(format!(
                "cluster connection '{}': address must not be empty",
                self.name
            )));
        }
        if self.max_hops == 0 {
            return Err(ConfigError::Validation(format!(
                "cluster connection '{}': max_hops must be at least 1",
                self.name
            )));
        }
        if self.confirmation_window_size == 0 {
            return Err(ConfigError::Validation(format!(
                "cluster connection '{}': confirmation_window_size must be positive",
                self.name
            )));
        }
        if self.duplicate_cache_size == 0 {
            return Err(ConfigError::Validation(format!(
                "cluster connection '{}': duplicate_cache_size must be positive",
                self.name
            )));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::Validation(format!(
                "cluster connection '{}': retry_interval must be positive",
                self.name
            )));
        }
        match (&self.discovery_group, self.static_connectors.is_empty()) {
            (None, true) => Err(ConfigError::Validation(format!(
                "cluster connection '{}': needs a discovery_group or static_connectors",
                self.name
            ))),
            (Some(_), false) => Err(ConfigError::Validation(format!(
                "cluster connection '{}': discovery_group and static_connectors are exclusive",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

/// Configuration for a discovery group listening for node announcements
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryGroupConfig {
    /// Discovery group name
    pub name: String,

    /// Entries not refreshed within this window are dropped
    #[serde(with = "humantime_serde")]
    pub refresh_timeout: Duration,

    /// How long cluster startup waits for a first peer (zero: no wait)
    #[serde(with = "humantime_serde")]
    pub initial_wait_timeout: Duration,

    /// Multicast group address
    pub group_address: Ipv4Addr,

    /// Multicast group port
    pub group_port: u16,
}

fn default_refresh_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_initial_wait_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_group_address() -> Ipv4Addr {
    Ipv4Addr::new(231, 7, 7, 7)
}

fn default_group_port() -> u16 {
    9876
}

impl Default for DiscoveryGroupConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            refresh_timeout: default_refresh_timeout(),
            initial_wait_timeout: default_initial_wait_timeout(),
            group_address: default_group_address(),
            group_port: default_group_port(),
        }
    }
}

impl DiscoveryGroupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation(
                "discovery group name must not be empty".to_string(),
            ));
        }
        if self.refresh_timeout.is_zero() {
            return Err(ConfigError::Validation(format!(
                "discovery group '{}': refresh_timeout must be positive",
                self.name
            )));
        }
        if !self.group_address.is_multicast() {
            return Err(ConfigError::Validation(format!(
                "discovery group '{}': {} is not a multicast address",
                self.name, self.group_address
            )));
        }
        Ok(())
    }
}

/// Configuration for a broadcast group announcing local connectors
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastGroupConfig {
    /// Broadcast group name
    pub name: String,

    /// Interval between announcements
    #[serde(with = "humantime_serde")]
    pub broadcast_period: Duration,

    /// Named connectors to advertise
    pub connector_names: Vec<String>,

    /// Multicast group address
    pub group_address: Ipv4Addr,

    /// Multicast group port
    pub group_port: u16,
}

fn default_broadcast_period() -> Duration {
    Duration::from_millis(1000)
}

impl Default for BroadcastGroupConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            broadcast_period: default_broadcast_period(),
            connector_names: Vec::new(),
            group_address: default_group_address(),
            group_port: default_group_port(),
        }
    }
}

impl BroadcastGroupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation(
                "broadcast group name must not be empty".to_string(),
            ));
        }
        if self.broadcast_period.is_zero() {
            return Err(ConfigError::Validation(format!(
                "broadcast group '{}': broadcast_period must be positive",
                self.name
            )));
        }
        if self.connector_names.is_empty() {
            return Err(ConfigError::Validation(format!(
                "broadcast group '{}': needs at least one connector to advertise",
                self.name
            )));
        }
        if !self.group_address.is_multicast() {
            return Err(ConfigError::Validation(format!(
                "broadcast group '{}': {} is not a multicast address",
                self.name, self.group_address
            )));
        }
        Ok(())
    }
}
