//! Cluster Connection Bridge
//!
//! One forwarding link to one peer node. Connects, handshakes, streams
//! eligible messages with hop metadata and duplicate tagging, and keeps
//! unconfirmed in-flight data under the confirmation window. Failures
//! stay inside the bridge: the link retries with backoff and resends
//! from the confirmed watermark, and status is reported to the owning
//! cluster connection as events.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClusterConnectionConfig;
use crate::dedup::DuplicateId;
use crate::queue::QueueEngine;
use crate::topology::Topology;
use crate::transport::{self, ConnectorPair};

use super::protocol::{
    frame_message, read_frame_length, ClusterMessage, ConnectorInfo, TopologyUpdate,
    CLUSTER_PROTOCOL_VERSION,
};
use super::ClusterError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(15);
const TOPOLOGY_INTERVAL: Duration = Duration::from_secs(2);
const READ_BUFFER_SIZE: usize = 65536;

/// Bridge link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Establishing the transport connection
    Connecting,
    /// Handshake completed
    Connected,
    /// Streaming messages
    Forwarding,
    /// Graceful shutdown in progress
    Closing,
    /// Link failed, backing off before reconnect
    Failed,
    /// Bridge is done and will not reconnect
    Stopped,
}

/// Status and topology information a bridge reports to its owning
/// cluster connection
#[derive(Debug)]
pub enum BridgeEvent {
    /// The bridge moved to a new state
    StateChanged { peer: String, state: BridgeState },
    /// The peer relayed its topology over this link
    TopologyReceived {
        peer: String,
        entries: Vec<TopologyUpdate>,
    },
}

#[derive(Debug)]
enum BridgeCommand {
    Shutdown,
}

/// A live forwarding link to one peer node.
///
/// Created and destroyed by the owning [`super::ClusterConnection`];
/// a bridge never resurrects itself after `stop()`.
pub struct ClusterBridge {
    peer_key: String,
    connector: ConnectorPair,
    local_node_id: String,
    local_connector: ConnectorPair,
    config: Arc<ClusterConnectionConfig>,
    state: Arc<RwLock<BridgeState>>,
    peer_node_id: Arc<RwLock<Option<String>>>,
    command_tx: Option<mpsc::Sender<BridgeCommand>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterBridge {
    /// Create a bridge toward `connector`. `peer_key` is the node id for
    /// discovered peers, the connector string for static ones.
    pub fn new(
        peer_key: impl Into<String>,
        connector: ConnectorPair,
        local_node_id: impl Into<String>,
        local_connector: ConnectorPair,
        config: Arc<ClusterConnectionConfig>,
    ) -> Self {
        Self {
            peer_key: peer_key.into(),
            connector,
            local_node_id: local_node_id.into(),
            local_connector,
            config,
            state: Arc::new(RwLock::new(BridgeState::Connecting)),
            peer_node_id: Arc::new(RwLock::new(None)),
            command_tx: None,
            task: Mutex::new(None),
        }
    }

    /// Key the owning cluster connection tracks this bridge under
    pub fn peer_key(&self) -> &str {
        &self.peer_key
    }

    /// Current link state
    pub fn state(&self) -> BridgeState {
        *self.state.read()
    }

    /// Peer node id learned during the handshake
    pub fn peer_node_id(&self) -> Option<String> {
        self.peer_node_id.read().clone()
    }

    /// Connector this bridge dials
    pub fn connector(&self) -> &ConnectorPair {
        &self.connector
    }

    /// Spawn the link task and return the bridge ready to use
    pub fn spawn(
        mut self,
        queue: Arc<dyn QueueEngine>,
        topology: Arc<Topology>,
        events: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(16);
        self.command_tx = Some(tx);

        let link = LinkContext {
            peer_key: self.peer_key.clone(),
            connector: self.connector.clone(),
            local_node_id: self.local_node_id.clone(),
            local_connector: self.local_connector.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            peer_node_id: self.peer_node_id.clone(),
            queue,
            topology,
            events,
        };

        let handle = tokio::spawn(async move {
            link.run(rx).await;
        });
        *self.task.lock() = Some(handle);

        Arc::new(self)
    }

    /// Signal the link to close and wait for it to finish.
    ///
    /// Returns only once in-flight forwarding reached a safe stopping
    /// point, so the caller knows nothing is ambiguously "maybe sent".
    pub async fn stop(&self) {
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(BridgeCommand::Shutdown).await;
        }
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Everything the link task owns
struct LinkContext {
    peer_key: String,
    connector: ConnectorPair,
    local_node_id: String,
    local_connector: ConnectorPair,
    config: Arc<ClusterConnectionConfig>,
    state: Arc<RwLock<BridgeState>>,
    peer_node_id: Arc<RwLock<Option<String>>>,
    queue: Arc<dyn QueueEngine>,
    topology: Arc<Topology>,
    events: mpsc::UnboundedSender<BridgeEvent>,
}

impl LinkContext {
    fn set_state(&self, state: BridgeState) {
        *self.state.write() = state;
        let _ = self.events.send(BridgeEvent::StateChanged {
            peer: self.peer_key.clone(),
            state,
        });
    }

    /// Connect/forward/confirm loop with reconnection.
    ///
    /// The confirmed watermark position survives reconnects: after a
    /// failure the cursor rewinds to it, so unconfirmed messages are
    /// retransmitted (at-least-once across reconnect).
    async fn run(self, mut command_rx: mpsc::Receiver<BridgeCommand>) {
        let mut retry_interval = self.config.retry_interval;
        let mut confirmed_position: u64 = 0;

        loop {
            self.set_state(BridgeState::Connecting);
            debug!(
                "Bridge '{}': Connecting to {}",
                self.peer_key, self.connector
            );

            match self
                .connect_and_run(&mut command_rx, &mut confirmed_position, &mut retry_interval)
                .await
            {
                Ok(()) => {
                    info!("Bridge '{}': Closed", self.peer_key);
                    self.set_state(BridgeState::Stopped);
                    return;
                }
                Err(e) => {
                    warn!("Bridge '{}': Link failed: {}", self.peer_key, e);
                    self.set_state(BridgeState::Failed);

                    debug!(
                        "Bridge '{}': Reconnecting in {:?}",
                        self.peer_key, retry_interval
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(retry_interval) => {}
                        _ = command_rx.recv() => {
                            info!("Bridge '{}': Shutdown requested", self.peer_key);
                            self.set_state(BridgeState::Stopped);
                            return;
                        }
                    }
                    retry_interval =
                        std::cmp::min(retry_interval * 2, self.config.max_retry_interval);
                }
            }
        }
    }

    async fn connect_and_run(
        &self,
        command_rx: &mut mpsc::Receiver<BridgeCommand>,
        confirmed_position: &mut u64,
        retry_interval: &mut Duration,
    ) -> Result<(), ClusterError> {
        let stream = tokio::select! {
            result = transport::connect(&self.connector, CONNECT_TIMEOUT) => result?,
            _ = command_rx.recv() => return Ok(()),
        };
        let (mut read_half, mut write_half) = stream.into_split();

        // Handshake: identify ourselves and learn the peer's node id.
        let hello = ClusterMessage::Hello {
            node_id: self.local_node_id.clone(),
            version: CLUSTER_PROTOCOL_VERSION,
            address: self.config.address.clone(),
            connector: ConnectorInfo::from_pair(
                self.config.connector_name.clone(),
                &self.local_connector,
            ),
        };
        send_message(&mut write_half, &hello).await?;

        let ack = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_one_frame(&mut read_half))
            .await
            .map_err(|_| ClusterError::Timeout)??;
        let peer_id = match ack {
            ClusterMessage::HelloAck { node_id, version } => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(ClusterError::Handshake(format!(
                        "protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                node_id
            }
            other => {
                return Err(ClusterError::Handshake(format!(
                    "expected HelloAck, got {}",
                    other.type_name()
                )))
            }
        };

        info!(
            "Bridge '{}': Connected to node '{}' at {}",
            self.peer_key, peer_id, self.connector
        );
        *self.peer_node_id.write() = Some(peer_id);
        self.set_state(BridgeState::Connected);
        *retry_interval = self.config.retry_interval;

        // Share what we know before forwarding starts.
        self.send_topology(&mut write_half).await?;
        self.set_state(BridgeState::Forwarding);

        self.forward_loop(
            &mut read_half,
            &mut write_half,
            command_rx,
            confirmed_position,
        )
        .await
    }

    async fn forward_loop(
        &self,
        read_half: &mut OwnedReadHalf,
        write_half: &mut OwnedWriteHalf,
        command_rx: &mut mpsc::Receiver<BridgeCommand>,
        confirmed_position: &mut u64,
    ) -> Result<(), ClusterError> {
        // Per-link accounting; byte counters restart with every link.
        let mut cursor: u64 = *confirmed_position;
        let mut pending: VecDeque<(u64, u64)> = VecDeque::new();
        let mut sent_bytes: u64 = 0;
        let mut confirmed_bytes: u64 = 0;
        let mut remote_consumers: Option<u32> = None;

        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        ping_timer.reset();
        let mut topology_timer = tokio::time::interval(TOPOLOGY_INTERVAL);
        topology_timer.reset();

        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut buf_offset = 0usize;

        loop {
            let window_open = sent_bytes - confirmed_bytes < self.config.confirmation_window_size;
            let consumers_want_it =
                self.config.forward_when_no_consumers || remote_consumers.unwrap_or(1) > 0;

            tokio::select! {
                Some(BridgeCommand::Shutdown) = command_rx.recv() => {
                    self.set_state(BridgeState::Closing);
                    let _ = send_message(write_half, &ClusterMessage::Goodbye).await;
                    return Ok(());
                }

                next = self.queue.next_eligible(&self.config.address, cursor),
                    if window_open && consumers_want_it =>
                {
                    let (position, message) = match next {
                        Some(next) => next,
                        // Queue engine is shutting down.
                        None => return Ok(()),
                    };

                    if message.hop_count >= self.config.max_hops {
                        debug!(
                            "Bridge '{}': Message at position {} reached hop ceiling, not forwarded",
                            self.peer_key, position
                        );
                        cursor = position + 1;
                        continue;
                    }

                    let duplicate_id = if self.config.duplicate_detection {
                        Some(message.duplicate_id.clone().unwrap_or_else(|| {
                            DuplicateId::new(self.local_node_id.clone(), position)
                        }))
                    } else {
                        message.duplicate_id.clone()
                    };

                    let size = message.size();
                    let forward = ClusterMessage::Forward {
                        address: self.config.address.clone(),
                        payload: message.payload.to_vec(),
                        hop_count: message.hop_count,
                        duplicate_id,
                        sequence: position,
                    };
                    send_message(write_half, &forward).await?;

                    sent_bytes += size;
                    pending.push_back((position, sent_bytes));
                    cursor = position + 1;
                    debug!(
                        "Bridge '{}': Forwarded position {} ({} bytes in flight)",
                        self.peer_key,
                        position,
                        sent_bytes - confirmed_bytes
                    );
                }

                result = read_half.read(&mut read_buf[buf_offset..]) => {
                    let n = result.map_err(|e| ClusterError::ConnectionLost(e.to_string()))?;
                    if n == 0 {
                        return Err(ClusterError::ConnectionLost("connection closed".to_string()));
                    }
                    buf_offset += n;

                    while let Some(len) = read_frame_length(&read_buf[..buf_offset]) {
                        let len = len as usize;
                        if 4 + len > read_buf.len() {
                            read_buf.resize(4 + len, 0);
                            break;
                        }
                        if buf_offset < 4 + len {
                            break;
                        }

                        match ClusterMessage::decode(&read_buf[4..4 + len]) {
                            Ok(ClusterMessage::Confirm { confirmed_bytes: watermark }) => {
                                // Monotonic, and never past what was sent.
                                confirmed_bytes = confirmed_bytes.max(watermark.min(sent_bytes));
                                while let Some(&(position, through)) = pending.front() {
                                    if through <= confirmed_bytes {
                                        pending.pop_front();
                                        *confirmed_position = position + 1;
                                    } else {
                                        break;
                                    }
                                }
                            }
                            Ok(ClusterMessage::TopologySnapshot { entries }) => {
                                let _ = self.events.send(BridgeEvent::TopologyReceived {
                                    peer: self.peer_key.clone(),
                                    entries,
                                });
                            }
                            Ok(ClusterMessage::ConsumerCount { address, count }) => {
                                if address == self.config.address {
                                    remote_consumers = Some(count);
                                }
                            }
                            Ok(ClusterMessage::Ping) => {
                                send_message(write_half, &ClusterMessage::Pong).await?;
                            }
                            Ok(ClusterMessage::Pong) => {}
                            Ok(ClusterMessage::Goodbye) => {
                                return Err(ClusterError::ConnectionLost(
                                    "peer disconnected".to_string(),
                                ));
                            }
                            Ok(other) => {
                                debug!(
                                    "Bridge '{}': Unexpected {} ignored",
                                    self.peer_key,
                                    other.type_name()
                                );
                            }
                            Err(e) => {
                                debug!("Bridge '{}': Undecodable frame: {}", self.peer_key, e);
                            }
                        }

                        read_buf.copy_within(4 + len..buf_offset, 0);
                        buf_offset -= 4 + len;
                    }
                }

                _ = topology_timer.tick() => {
                    self.send_topology(write_half).await?;
                }

                _ = ping_timer.tick() => {
                    send_message(write_half, &ClusterMessage::Ping).await?;
                }
            }
        }
    }

    async fn send_topology(&self, write_half: &mut OwnedWriteHalf) -> Result<(), ClusterError> {
        let entries: Vec<TopologyUpdate> = self
            .topology
            .snapshot()
            .iter()
            .map(TopologyUpdate::from_entry)
            .collect();
        send_message(write_half, &ClusterMessage::TopologySnapshot { entries }).await
    }
}

async fn send_message(
    write_half: &mut OwnedWriteHalf,
    msg: &ClusterMessage,
) -> Result<(), ClusterError> {
    let frame =
        frame_message(msg).map_err(|e| ClusterError::Other(format!("encode error: {}", e)))?;
    write_half
        .write_all(&frame)
        .await
        .map_err(|e| ClusterError::ConnectionLost(e.to_string()))?;
    Ok(())
}

/// Read exactly one framed message; used only during the handshake,
/// before the buffered select loop takes over.
async fn read_one_frame(read_half: &mut OwnedReadHalf) -> Result<ClusterMessage, ClusterError> {
    let mut len_buf = [0u8; 4];
    read_half
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| ClusterError::ConnectionLost(e.to_string()))?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    read_half
        .read_exact(&mut payload)
        .await
        .map_err(|e| ClusterError::ConnectionLost(e.to_string()))?;

    ClusterMessage::decode(&payload).map_err(|e| ClusterError::Handshake(e.to_string()))
}
