//! Discovery Group
//!
//! Listens on a broadcast endpoint, decodes peer announcements, and
//! maintains the live set of discovered nodes. Entries expire when a
//! node stops announcing; expiry is reported to subscribers as a
//! node-left event.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastEndpoint, BroadcastEndpointFactory};
use crate::cluster::protocol::NodeAnnouncement;
use crate::transport::ConnectorPair;

/// Capacity of each subscriber's event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Membership change observed by a discovery group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A node announced itself for the first time (or after expiring)
    NodeSeen {
        node_id: String,
        connector: ConnectorPair,
    },
    /// A node stopped announcing and its entry expired
    NodeLeft { node_id: String },
}

#[derive(Debug, Clone)]
struct DiscoveredNode {
    connector: ConnectorPair,
    last_seen: Instant,
}

/// Listens for node announcements and tracks which peers are alive.
///
/// Repeated announcements from the same node only refresh its entry;
/// the node id is the dedup key, not connector identity. The local
/// node's own announcements are ignored.
pub struct DiscoveryGroup {
    name: String,
    local_node_id: String,
    refresh_timeout: Duration,
    initial_wait_timeout: Duration,
    factory: Arc<dyn BroadcastEndpointFactory>,
    nodes: Arc<DashMap<String, DiscoveredNode>>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<DiscoveryEvent>>>>,
    first_seen: Arc<Notify>,
    any_seen: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryGroup {
    pub fn new(
        name: impl Into<String>,
        local_node_id: impl Into<String>,
        refresh_timeout: Duration,
        initial_wait_timeout: Duration,
        factory: Arc<dyn BroadcastEndpointFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            local_node_id: local_node_id.into(),
            refresh_timeout,
            initial_wait_timeout,
            factory,
            nodes: Arc::new(DashMap::new()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            first_seen: Arc::new(Notify::new()),
            any_seen: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Group name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Begin listening and sweeping expired entries
    pub async fn start(&self) -> io::Result<()> {
        let endpoint = self.factory.create().await?;

        info!(
            "Discovery group '{}': Listening (refresh timeout {:?})",
            self.name, self.refresh_timeout
        );

        let receive = {
            let name = self.name.clone();
            let local_node_id = self.local_node_id.clone();
            let nodes = self.nodes.clone();
            let subscribers = self.subscribers.clone();
            let first_seen = self.first_seen.clone();
            let any_seen = self.any_seen.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                Self::receive_loop(
                    name,
                    local_node_id,
                    endpoint,
                    nodes,
                    subscribers,
                    first_seen,
                    any_seen,
                    shutdown,
                )
                .await;
            })
        };

        let sweep = {
            let name = self.name.clone();
            let refresh_timeout = self.refresh_timeout;
            let nodes = self.nodes.clone();
            let subscribers = self.subscribers.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                Self::sweep_loop(name, refresh_timeout, nodes, subscribers, shutdown).await;
            })
        };

        self.tasks.lock().extend([receive, sweep]);
        Ok(())
    }

    /// Stop listening and drop all state
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.nodes.clear();
        info!("Discovery group '{}': Stopped", self.name);
    }

    /// Non-expired discovered nodes
    pub fn nodes(&self) -> HashMap<String, ConnectorPair> {
        let now = Instant::now();
        self.nodes
            .iter()
            .filter(|entry| now.duration_since(entry.value().last_seen) <= self.refresh_timeout)
            .map(|entry| (entry.key().clone(), entry.value().connector.clone()))
            .collect()
    }

    /// Subscribe to node-seen/node-left events.
    ///
    /// Nodes already known at subscription time are replayed as
    /// node-seen events so late subscribers never miss a peer.
    pub fn subscribe(&self) -> mpsc::Receiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        for entry in self.nodes.iter() {
            let _ = tx.try_send(DiscoveryEvent::NodeSeen {
                node_id: entry.key().clone(),
                connector: entry.value().connector.clone(),
            });
        }
        self.subscribers.lock().push(tx);
        rx
    }

    /// Block until at least one peer has been seen, bounded by the
    /// configured initial wait timeout. A zero timeout does not wait.
    /// Returns whether any peer is known.
    pub async fn await_initial_discovery(&self) -> bool {
        if self.initial_wait_timeout.is_zero() {
            return self.any_seen.load(Ordering::Acquire);
        }

        let notified = self.first_seen.notified();
        if self.any_seen.load(Ordering::Acquire) {
            return true;
        }
        tokio::time::timeout(self.initial_wait_timeout, notified)
            .await
            .is_ok()
    }

    #[allow(clippy::too_many_arguments)]
    async fn receive_loop(
        name: String,
        local_node_id: String,
        endpoint: Box<dyn BroadcastEndpoint>,
        nodes: Arc<DashMap<String, DiscoveredNode>>,
        subscribers: Arc<Mutex<Vec<mpsc::Sender<DiscoveryEvent>>>>,
        first_seen: Arc<Notify>,
        any_seen: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
    ) {
        loop {
            let payload = tokio::select! {
                result = endpoint.receive() => match result {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Discovery group '{}': Receive failed: {}", name, e);
                        return;
                    }
                },
                _ = shutdown.notified() => return,
            };

            let announcement = match NodeAnnouncement::decode(&payload) {
                Ok(announcement) => announcement,
                Err(e) => {
                    debug!("Discovery group '{}': Undecodable announcement: {}", name, e);
                    continue;
                }
            };

            // Our own announcements come back over the channel too.
            if announcement.node_id == local_node_id {
                continue;
            }

            let connector = match announcement.connectors.iter().find_map(|c| c.to_pair()) {
                Some(connector) => connector,
                None => {
                    debug!(
                        "Discovery group '{}': Announcement from '{}' carried no usable connector",
                        name, announcement.node_id
                    );
                    continue;
                }
            };

            let is_new = match nodes.get_mut(&announcement.node_id) {
                Some(mut existing) => {
                    existing.connector = connector.clone();
                    existing.last_seen = Instant::now();
                    false
                }
                None => {
                    nodes.insert(
                        announcement.node_id.clone(),
                        DiscoveredNode {
                            connector: connector.clone(),
                            last_seen: Instant::now(),
                        },
                    );
                    true
                }
            };

            if is_new {
                info!(
                    "Discovery group '{}': Discovered node '{}' at {}",
                    name, announcement.node_id, connector
                );
                any_seen.store(true, Ordering::Release);
                first_seen.notify_waiters();
                Self::publish(
                    &name,
                    &subscribers,
                    DiscoveryEvent::NodeSeen {
                        node_id: announcement.node_id,
                        connector,
                    },
                );
            }
        }
    }

    async fn sweep_loop(
        name: String,
        refresh_timeout: Duration,
        nodes: Arc<DashMap<String, DiscoveredNode>>,
        subscribers: Arc<Mutex<Vec<mpsc::Sender<DiscoveryEvent>>>>,
        shutdown: Arc<Notify>,
    ) {
        let sweep_interval = (refresh_timeout / 2).max(Duration::from_millis(50));
        let mut timer = tokio::time::interval(sweep_interval);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let now = Instant::now();
                    let expired: Vec<String> = nodes
                        .iter()
                        .filter(|entry| now.duration_since(entry.value().last_seen) > refresh_timeout)
                        .map(|entry| entry.key().clone())
                        .collect();

                    for node_id in expired {
                        if nodes.remove(&node_id).is_some() {
                            info!(
                                "Discovery group '{}': Node '{}' stopped announcing",
                                name, node_id
                            );
                            Self::publish(
                                &name,
                                &subscribers,
                                DiscoveryEvent::NodeLeft { node_id },
                            );
                        }
                    }
                }
                _ = shutdown.notified() => return,
            }
        }
    }

    fn publish(
        name: &str,
        subscribers: &Mutex<Vec<mpsc::Sender<DiscoveryEvent>>>,
        event: DiscoveryEvent,
    ) {
        let mut subscribers = subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Discovery group '{}': Subscriber lagging, event dropped", name);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}
