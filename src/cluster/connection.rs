//! Cluster Connection
//!
//! Coordinator for one cluster-connection configuration: consumes
//! discovery events (or a static connector list), decides which peers
//! need a bridge, owns the bridge lifecycle, and merges topology
//! updates relayed back over those bridges.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClusterConnectionConfig;
use crate::discovery::{DiscoveryEvent, DiscoveryGroup};
use crate::queue::QueueEngine;
use crate::topology::Topology;
use crate::transport::ConnectorPair;

use super::bridge::{BridgeEvent, BridgeState, ClusterBridge};
use super::ClusterError;

/// Cluster connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterConnectionState {
    /// Not running
    Stopped,
    /// Waiting for initial discovery
    Starting,
    /// Coordinator running, bridges managed
    Active,
}

/// One configured forwarding relationship between this broker and a
/// group of peers.
///
/// Bridges are created here and only here; a failed bridge retries on
/// its own, but a torn-down bridge is recreated by this coordinator,
/// never by itself.
pub struct ClusterConnection {
    config: Arc<ClusterConnectionConfig>,
    local_node_id: String,
    local_connector: ConnectorPair,
    static_connectors: Vec<ConnectorPair>,
    topology: Arc<Topology>,
    queue: Arc<dyn QueueEngine>,
    discovery: Option<Arc<DiscoveryGroup>>,
    state: Arc<RwLock<ClusterConnectionState>>,
    bridges: Arc<DashMap<String, Arc<ClusterBridge>>>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterConnection {
    /// Validate the configuration and build the connection.
    ///
    /// Configuration problems are fatal here: an invalid cluster
    /// connection never starts.
    pub fn new(
        config: ClusterConnectionConfig,
        local_node_id: impl Into<String>,
        local_connector: ConnectorPair,
        topology: Arc<Topology>,
        queue: Arc<dyn QueueEngine>,
        discovery: Option<Arc<DiscoveryGroup>>,
    ) -> Result<Self, ClusterError> {
        config
            .validate()
            .map_err(|e| ClusterError::InvalidConfig(e.to_string()))?;

        if let Some(group) = &config.discovery_group {
            if discovery.is_none() {
                return Err(ClusterError::InvalidConfig(format!(
                    "cluster connection '{}': discovery group '{}' not found",
                    config.name, group
                )));
            }
        }

        let mut static_connectors = Vec::with_capacity(config.static_connectors.len());
        for connector in &config.static_connectors {
            let address = connector.parse().map_err(|_| {
                ClusterError::InvalidConfig(format!(
                    "cluster connection '{}': invalid static connector '{}'",
                    config.name, connector
                ))
            })?;
            static_connectors.push(ConnectorPair::new(address));
        }

        Ok(Self {
            config: Arc::new(config),
            local_node_id: local_node_id.into(),
            local_connector,
            static_connectors,
            topology,
            queue,
            discovery,
            state: Arc::new(RwLock::new(ClusterConnectionState::Stopped)),
            bridges: Arc::new(DashMap::new()),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        })
    }

    /// Cluster connection name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Whether the connection has been started and not yet stopped
    pub fn is_started(&self) -> bool {
        matches!(
            *self.state.read(),
            ClusterConnectionState::Starting | ClusterConnectionState::Active
        )
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClusterConnectionState {
        *self.state.read()
    }

    /// Known nodes as a `node id -> remote address` map, for
    /// operational tooling and convergence checks
    pub fn nodes(&self) -> HashMap<String, String> {
        self.topology
            .snapshot()
            .into_iter()
            .map(|entry| (entry.node_id, entry.connector.address.to_string()))
            .collect()
    }

    /// Per-bridge link states
    pub fn bridge_states(&self) -> Vec<(String, BridgeState)> {
        self.bridges
            .iter()
            .map(|b| (b.key().clone(), b.value().state()))
            .collect()
    }

    /// Subscribe to discovery (or dial static connectors) and start the
    /// coordinator.
    ///
    /// Finding no peer within the discovery group's initial wait is not
    /// an error: the connection starts degraded and keeps listening.
    pub async fn start(&self) -> Result<(), ClusterError> {
        if self.is_started() {
            return Ok(());
        }
        *self.state.write() = ClusterConnectionState::Starting;
        info!("Cluster connection '{}': Starting", self.config.name);

        let (bridge_events_tx, bridge_events_rx) = mpsc::unbounded_channel();

        let discovery_rx = match &self.discovery {
            Some(discovery) => {
                let rx = discovery.subscribe();
                if !discovery.await_initial_discovery().await {
                    info!(
                        "Cluster connection '{}': No peers discovered yet, starting degraded",
                        self.config.name
                    );
                }
                Some(rx)
            }
            None => None,
        };

        // Static peers are bridged immediately, keyed by connector.
        for connector in &self.static_connectors {
            Self::spawn_bridge(
                connector.address.to_string(),
                connector.clone(),
                &self.local_node_id,
                &self.local_connector,
                &self.config,
                &self.queue,
                &self.topology,
                &bridge_events_tx,
                &self.bridges,
            );
        }

        let coordinator = Coordinator {
            config: self.config.clone(),
            local_node_id: self.local_node_id.clone(),
            local_connector: self.local_connector.clone(),
            topology: self.topology.clone(),
            queue: self.queue.clone(),
            bridges: self.bridges.clone(),
            shutdown: self.shutdown.clone(),
        };
        let handle = tokio::spawn(async move {
            coordinator
                .run(discovery_rx, bridge_events_rx, bridge_events_tx)
                .await;
        });
        *self.task.lock() = Some(handle);

        *self.state.write() = ClusterConnectionState::Active;
        Ok(())
    }

    /// Close all bridges, stop the coordinator, and wait for both.
    pub async fn stop(&self) {
        if !self.is_started() {
            return;
        }
        info!("Cluster connection '{}': Stopping", self.config.name);

        self.shutdown.notify_waiters();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let peers: Vec<String> = self.bridges.iter().map(|b| b.key().clone()).collect();
        for peer in peers {
            if let Some((_, bridge)) = self.bridges.remove(&peer) {
                bridge.stop().await;
            }
        }

        *self.state.write() = ClusterConnectionState::Stopped;
        info!("Cluster connection '{}': Stopped", self.config.name);
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_bridge(
        peer_key: String,
        connector: ConnectorPair,
        local_node_id: &str,
        local_connector: &ConnectorPair,
        config: &Arc<ClusterConnectionConfig>,
        queue: &Arc<dyn QueueEngine>,
        topology: &Arc<Topology>,
        events_tx: &mpsc::UnboundedSender<BridgeEvent>,
        bridges: &DashMap<String, Arc<ClusterBridge>>,
    ) {
        if bridges.contains_key(&peer_key) {
            return;
        }

        info!(
            "Cluster connection '{}': Creating bridge to '{}' at {}",
            config.name, peer_key, connector
        );
        let bridge = ClusterBridge::new(
            peer_key.clone(),
            connector,
            local_node_id,
            local_connector.clone(),
            config.clone(),
        )
        .spawn(queue.clone(), topology.clone(), events_tx.clone());
        bridges.insert(peer_key, bridge);
    }
}

/// The per-connection coordinator task: reacts to discovery and bridge
/// events, funneling all bridge-set mutations through one place.
struct Coordinator {
    config: Arc<ClusterConnectionConfig>,
    local_node_id: String,
    local_connector: ConnectorPair,
    topology: Arc<Topology>,
    queue: Arc<dyn QueueEngine>,
    bridges: Arc<DashMap<String, Arc<ClusterBridge>>>,
    shutdown: Arc<Notify>,
}

impl Coordinator {
    async fn run(
        self,
        mut discovery_rx: Option<mpsc::Receiver<DiscoveryEvent>>,
        mut bridge_events_rx: mpsc::UnboundedReceiver<BridgeEvent>,
        bridge_events_tx: mpsc::UnboundedSender<BridgeEvent>,
    ) {
        loop {
            tokio::select! {
                event = recv_discovery(&mut discovery_rx) => {
                    match event {
                        Some(DiscoveryEvent::NodeSeen { node_id, connector }) => {
                            self.on_node_seen(node_id, connector, &bridge_events_tx);
                        }
                        Some(DiscoveryEvent::NodeLeft { node_id }) => {
                            self.on_node_left(&node_id).await;
                        }
                        None => {
                            warn!(
                                "Cluster connection '{}': Discovery group stopped",
                                self.config.name
                            );
                            discovery_rx = None;
                        }
                    }
                }
                Some(event) = bridge_events_rx.recv() => {
                    match event {
                        BridgeEvent::StateChanged { peer, state } => {
                            debug!(
                                "Cluster connection '{}': Bridge '{}' is now {:?}",
                                self.config.name, peer, state
                            );
                        }
                        BridgeEvent::TopologyReceived { peer, entries } => {
                            self.on_topology_received(&peer, entries);
                        }
                    }
                }
                _ = self.shutdown.notified() => return,
            }
        }
    }

    fn on_node_seen(
        &self,
        node_id: String,
        connector: ConnectorPair,
        events_tx: &mpsc::UnboundedSender<BridgeEvent>,
    ) {
        if node_id == self.local_node_id {
            return;
        }

        // Directly discovered: hop distance 0, wins ties in the merge.
        self.topology.merge(&node_id, connector.clone(), 0, true);

        ClusterConnection::spawn_bridge(
            node_id,
            connector,
            &self.local_node_id,
            &self.local_connector,
            &self.config,
            &self.queue,
            &self.topology,
            events_tx,
            &self.bridges,
        );
    }

    async fn on_node_left(&self, node_id: &str) {
        self.topology.remove(node_id);
        if let Some((_, bridge)) = self.bridges.remove(node_id) {
            info!(
                "Cluster connection '{}': Tearing down bridge to '{}'",
                self.config.name, node_id
            );
            bridge.stop().await;
        }
    }

    /// Merge a peer-relayed snapshot: one hop further than the peer
    /// knows it, never accepting facts about this node itself.
    fn on_topology_received(
        &self,
        peer: &str,
        entries: Vec<crate::cluster::protocol::TopologyUpdate>,
    ) {
        for entry in entries {
            if entry.node_id == self.local_node_id {
                continue;
            }
            let Some(pair) = entry.connector.to_pair() else {
                continue;
            };
            if self.topology.merge(&entry.node_id, pair, entry.hops + 1, false) {
                debug!(
                    "Cluster connection '{}': Learned '{}' at {} hops via '{}'",
                    self.config.name,
                    entry.node_id,
                    entry.hops + 1,
                    peer
                );
            }
        }
    }
}

async fn recv_discovery(
    rx: &mut Option<mpsc::Receiver<DiscoveryEvent>>,
) -> Option<DiscoveryEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
