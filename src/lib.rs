//! MeshMQ - Clustered message broker
//!
//! Brokers discover each other over UDP multicast, form bidirectional
//! forwarding links, and relay messages between nodes with hop-limited
//! forwarding, duplicate rejection, and flow-controlled
//! acknowledgement.

pub mod broadcast;
pub mod broker;
pub mod cluster;
pub mod config;
pub mod dedup;
pub mod discovery;
pub mod queue;
pub mod topology;
pub mod transport;

pub use broadcast::{BroadcastGroup, LocalBroadcastBus, UdpBroadcastEndpointFactory};
pub use broker::BrokerNode;
pub use cluster::{BridgeState, ClusterBridge, ClusterConnection, ClusterError};
pub use config::{Config, ConfigError};
pub use dedup::{DedupOutcome, DuplicateDetectionFilter, DuplicateId};
pub use discovery::{DiscoveryEvent, DiscoveryGroup};
pub use queue::{MemoryQueueEngine, Message, QueueEngine};
pub use topology::{Topology, TopologyEntry};
pub use transport::ConnectorPair;
