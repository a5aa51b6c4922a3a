//! Broker Node
//!
//! Assembles the cluster subsystem from a validated configuration:
//! queue engine, cluster acceptor, broadcast groups, discovery groups,
//! and cluster connections, with ordered startup and shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::broadcast::{BroadcastGroup, UdpBroadcastEndpointFactory};
use crate::cluster::{ClusterAcceptor, ClusterConnection};
use crate::config::{Config, ConfigError};
use crate::dedup::DuplicateDetectionFilter;
use crate::discovery::DiscoveryGroup;
use crate::queue::MemoryQueueEngine;
use crate::topology::Topology;

/// A standalone broker node running the cluster subsystem.
pub struct BrokerNode {
    node_id: String,
    cluster_bind: SocketAddr,
    topology: Arc<Topology>,
    queue: Arc<MemoryQueueEngine>,
    acceptor: ClusterAcceptor,
    broadcast_groups: Vec<BroadcastGroup>,
    discovery_groups: HashMap<String, Arc<DiscoveryGroup>>,
    cluster_connections: Vec<Arc<ClusterConnection>>,
}

impl BrokerNode {
    /// Build a node from configuration. All validation happens here;
    /// a node that constructs successfully can start.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let node_id = config.node.get_node_id();

        // The topology ceiling is the widest any cluster connection
        // is allowed to see.
        let max_hops = config
            .cluster_connection
            .iter()
            .map(|c| c.max_hops)
            .max()
            .unwrap_or(1);
        let topology = Arc::new(Topology::new(node_id.clone(), max_hops));

        let duplicate_cache_size = config
            .cluster_connection
            .iter()
            .map(|c| c.duplicate_cache_size)
            .max()
            .unwrap_or(2048);
        let filter = Arc::new(DuplicateDetectionFilter::new(duplicate_cache_size));

        let queue = Arc::new(MemoryQueueEngine::new());

        let acceptor = ClusterAcceptor::new(
            node_id.clone(),
            topology.clone(),
            queue.clone(),
            filter,
        );

        let mut discovery_groups = HashMap::new();
        for group_config in &config.discovery_group {
            let factory = Arc::new(UdpBroadcastEndpointFactory {
                group_address: group_config.group_address,
                group_port: group_config.group_port,
            });
            let group = DiscoveryGroup::new(
                group_config.name.clone(),
                node_id.clone(),
                group_config.refresh_timeout,
                group_config.initial_wait_timeout,
                factory,
            );
            discovery_groups.insert(group_config.name.clone(), Arc::new(group));
        }

        let mut broadcast_groups = Vec::new();
        for group_config in &config.broadcast_group {
            let factory = Arc::new(UdpBroadcastEndpointFactory {
                group_address: group_config.group_address,
                group_port: group_config.group_port,
            });
            let group = BroadcastGroup::new(
                group_config.name.clone(),
                node_id.clone(),
                group_config.broadcast_period,
                factory,
            );
            for connector_name in &group_config.connector_names {
                // Presence and parseability were checked by validate().
                if let Some(pair) = config.connector_pair(connector_name) {
                    group.add_connector(connector_name.clone(), pair);
                }
            }
            broadcast_groups.push(group);
        }

        let mut cluster_connections = Vec::new();
        for connection_config in &config.cluster_connection {
            let local_connector = config
                .connector_pair(&connection_config.connector_name)
                .ok_or_else(|| {
                    ConfigError::Validation(format!(
                        "cluster connection '{}' references unknown connector '{}'",
                        connection_config.name, connection_config.connector_name
                    ))
                })?;
            let discovery = connection_config
                .discovery_group
                .as_ref()
                .and_then(|name| discovery_groups.get(name).cloned());

            let connection = ClusterConnection::new(
                connection_config.clone(),
                node_id.clone(),
                local_connector,
                topology.clone(),
                queue.clone(),
                discovery,
            )
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
            cluster_connections.push(Arc::new(connection));
        }

        Ok(Self {
            node_id,
            cluster_bind: config.node.cluster_bind,
            topology,
            queue,
            acceptor,
            broadcast_groups,
            discovery_groups,
            cluster_connections,
        })
    }

    /// This node's identity
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The queue engine backing this node
    pub fn queue_engine(&self) -> Arc<MemoryQueueEngine> {
        self.queue.clone()
    }

    /// The node's topology view
    pub fn topology(&self) -> Arc<Topology> {
        self.topology.clone()
    }

    /// Look up a cluster connection by name
    pub fn cluster_connection(&self, name: &str) -> Option<&Arc<ClusterConnection>> {
        self.cluster_connections.iter().find(|c| c.name() == name)
    }

    /// Address the cluster acceptor is bound to, once started
    pub fn cluster_addr(&self) -> Option<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Bring the node up: acceptor, discovery, broadcast, then cluster
    /// connections.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Node '{}': Starting", self.node_id);

        self.acceptor.start(self.cluster_bind).await?;

        for group in self.discovery_groups.values() {
            group.start().await?;
        }
        for group in &self.broadcast_groups {
            group.start().await?;
        }
        for connection in &self.cluster_connections {
            connection.start().await?;
        }

        info!("Node '{}': Started", self.node_id);
        Ok(())
    }

    /// Bring the node down in reverse start order.
    pub async fn stop(&self) {
        info!("Node '{}': Stopping", self.node_id);

        for connection in &self.cluster_connections {
            connection.stop().await;
        }
        for group in &self.broadcast_groups {
            group.stop().await;
        }
        for group in self.discovery_groups.values() {
            group.stop().await;
        }
        self.acceptor.stop().await;

        info!("Node '{}': Stopped", self.node_id);
    }
}
