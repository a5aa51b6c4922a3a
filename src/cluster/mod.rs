//! Cluster Connections
//!
//! Topology formation and inter-broker bridging: discovery-driven
//! bridge lifecycle, hop-limited forwarding, duplicate tagging, and
//! flow-controlled confirmation of delivery.
//!
//! # Architecture
//!
//! Two communication channels:
//! - **Broadcast (UDP multicast)**: Node announcement and discovery
//! - **Cluster TCP links**: Bridges forwarding messages between nodes
//!
//! A [`ClusterConnection`] consumes discovery events (or a static
//! connector list), owns one [`ClusterBridge`] per reachable peer, and
//! merges topology knowledge relayed over those links. The
//! [`ClusterAcceptor`] is the receiving side of every inbound link.

pub mod protocol;

mod acceptor;
mod bridge;
mod connection;

pub use acceptor::ClusterAcceptor;
pub use bridge::{BridgeEvent, BridgeState, ClusterBridge};
pub use connection::{ClusterConnection, ClusterConnectionState};

use std::fmt;

/// Error type for cluster link operations
#[derive(Debug)]
pub enum ClusterError {
    /// Connection to a peer failed or was lost
    ConnectionLost(String),
    /// Handshake with a peer failed (bad frame, version mismatch)
    Handshake(String),
    /// Peer rejected the operation
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// Invalid configuration
    InvalidConfig(String),
    /// Other error
    Other(String),
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            ClusterError::Handshake(msg) => write!(f, "Handshake failed: {}", msg),
            ClusterError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            ClusterError::Timeout => write!(f, "Operation timed out"),
            ClusterError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            ClusterError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        ClusterError::ConnectionLost(e.to_string())
    }
}
