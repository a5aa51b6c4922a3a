//! Broadcast Group
//!
//! Periodically announces this node's connectors over a broadcast
//! endpoint so peers can discover it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::protocol::{ConnectorInfo, NodeAnnouncement};
use crate::transport::ConnectorPair;

use super::endpoint::{BroadcastEndpoint, BroadcastEndpointFactory};

/// Announces the local node's connectors every `broadcast_period`.
///
/// Broadcast is best-effort: a send failure is logged and the next
/// period proceeds normally.
pub struct BroadcastGroup {
    name: String,
    node_id: String,
    period: Duration,
    factory: Arc<dyn BroadcastEndpointFactory>,
    connectors: Arc<Mutex<Vec<(String, ConnectorPair)>>>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastGroup {
    pub fn new(
        name: impl Into<String>,
        node_id: impl Into<String>,
        period: Duration,
        factory: Arc<dyn BroadcastEndpointFactory>,
    ) -> Self {
        Self {
            name: name.into(),
            node_id: node_id.into(),
            period,
            factory,
            connectors: Arc::new(Mutex::new(Vec::new())),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    /// Group name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a connector to advertise
    pub fn add_connector(&self, name: impl Into<String>, pair: ConnectorPair) {
        self.connectors.lock().push((name.into(), pair));
    }

    /// Begin periodic broadcasting
    pub async fn start(&self) -> io::Result<()> {
        let endpoint = self.factory.create().await?;

        info!(
            "Broadcast group '{}': Announcing every {:?}",
            self.name, self.period
        );

        let name = self.name.clone();
        let node_id = self.node_id.clone();
        let period = self.period;
        let connectors = self.connectors.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            Self::broadcast_loop(name, node_id, period, endpoint, connectors, shutdown).await;
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Halt broadcasting and release the endpoint
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Broadcast group '{}': Stopped", self.name);
    }

    async fn broadcast_loop(
        name: String,
        node_id: String,
        period: Duration,
        endpoint: Box<dyn BroadcastEndpoint>,
        connectors: Arc<Mutex<Vec<(String, ConnectorPair)>>>,
        shutdown: Arc<Notify>,
    ) {
        let mut timer = tokio::time::interval(period);
        let mut sequence: u64 = 0;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let announcement = NodeAnnouncement {
                        node_id: node_id.clone(),
                        connectors: connectors
                            .lock()
                            .iter()
                            .map(|(n, pair)| ConnectorInfo::from_pair(n.clone(), pair))
                            .collect(),
                        sequence,
                    };
                    sequence = sequence.wrapping_add(1);

                    let payload = match announcement.encode() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("Broadcast group '{}': Encode failed: {}", name, e);
                            continue;
                        }
                    };
                    if let Err(e) = endpoint.broadcast(&payload).await {
                        warn!("Broadcast group '{}': Send failed: {}", name, e);
                    } else {
                        debug!("Broadcast group '{}': Announced seq={}", name, sequence);
                    }
                }
                _ = shutdown.notified() => {
                    debug!("Broadcast group '{}': Shutdown requested", name);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::LocalBroadcastBus;

    fn connector(port: u16) -> ConnectorPair {
        ConnectorPair::new(format!("127.0.0.1:{}", port).parse().unwrap())
    }

    #[tokio::test]
    async fn test_broadcasts_registered_connectors() {
        let bus = LocalBroadcastBus::new();
        let listener = bus.endpoint();

        let group = BroadcastGroup::new(
            "bg",
            "node-a",
            Duration::from_millis(50),
            Arc::new(bus.clone()),
        );
        group.add_connector("cluster", connector(61616));
        group.start().await.unwrap();

        let payload = listener.receive().await.unwrap();
        let announcement = NodeAnnouncement::decode(&payload).unwrap();
        assert_eq!(announcement.node_id, "node-a");
        assert_eq!(announcement.connectors.len(), 1);
        assert_eq!(announcement.connectors[0].name, "cluster");

        group.stop().await;
    }

    #[tokio::test]
    async fn test_announcement_sequence_advances() {
        let bus = LocalBroadcastBus::new();
        let listener = bus.endpoint();

        let group = BroadcastGroup::new(
            "bg",
            "node-a",
            Duration::from_millis(20),
            Arc::new(bus.clone()),
        );
        group.add_connector("cluster", connector(1));
        group.start().await.unwrap();

        let first = NodeAnnouncement::decode(&listener.receive().await.unwrap()).unwrap();
        let second = NodeAnnouncement::decode(&listener.receive().await.unwrap()).unwrap();
        assert!(second.sequence > first.sequence);

        group.stop().await;
    }
}
