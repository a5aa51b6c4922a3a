//! Cluster Acceptor
//!
//! Receiving side of inbound cluster links. Accepts connections,
//! validates the handshake, and runs one task per link that applies
//! duplicate detection, enqueues forwarded messages with an
//! incremented hop count, confirms processed bytes back to the
//! sender, and keeps the sender's consumer-count hints fresh.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dedup::{DedupOutcome, DuplicateDetectionFilter};
use crate::queue::{Message, QueueEngine};
use crate::topology::Topology;

use super::protocol::{
    frame_message, read_frame_length, ClusterMessage, TopologyUpdate, CLUSTER_PROTOCOL_VERSION,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HINT_INTERVAL: Duration = Duration::from_millis(500);
const READ_BUFFER_SIZE: usize = 65536;

/// Accepts and serves inbound cluster links for a broker node.
pub struct ClusterAcceptor {
    node_id: String,
    topology: Arc<Topology>,
    queue: Arc<dyn QueueEngine>,
    filter: Arc<DuplicateDetectionFilter>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterAcceptor {
    pub fn new(
        node_id: impl Into<String>,
        topology: Arc<Topology>,
        queue: Arc<dyn QueueEngine>,
        filter: Arc<DuplicateDetectionFilter>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            topology,
            queue,
            filter,
            local_addr: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    /// Address the acceptor is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bind the listener and start accepting links.
    ///
    /// Returns the bound address (useful when binding port 0).
    pub async fn start(&self, bind: SocketAddr) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);

        info!("Cluster acceptor: Listening on {}", local_addr);

        let node_id = self.node_id.clone();
        let topology = self.topology.clone();
        let queue = self.queue.clone();
        let filter = self.filter.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            Self::accept_loop(listener, node_id, topology, queue, filter, shutdown).await;
        });
        *self.task.lock() = Some(handle);

        Ok(local_addr)
    }

    /// Stop accepting; links already established are told goodbye.
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Cluster acceptor: Stopped");
    }

    async fn accept_loop(
        listener: TcpListener,
        node_id: String,
        topology: Arc<Topology>,
        queue: Arc<dyn QueueEngine>,
        filter: Arc<DuplicateDetectionFilter>,
        shutdown: Arc<Notify>,
    ) {
        loop {
            let (stream, addr) = tokio::select! {
                result = listener.accept() => match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Cluster acceptor: Accept failed: {}", e);
                        continue;
                    }
                },
                _ = shutdown.notified() => return,
            };

            debug!("Cluster acceptor: Inbound link from {}", addr);

            let node_id = node_id.clone();
            let topology = topology.clone();
            let queue = queue.clone();
            let filter = filter.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::serve_link(stream, node_id, topology, queue, filter, shutdown).await
                {
                    debug!("Cluster acceptor: Link from {} ended: {}", addr, e);
                }
            });
        }
    }

    async fn serve_link(
        stream: TcpStream,
        node_id: String,
        topology: Arc<Topology>,
        queue: Arc<dyn QueueEngine>,
        filter: Arc<DuplicateDetectionFilter>,
        shutdown: Arc<Notify>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (mut read_half, mut write_half) = stream.into_split();

        // Expect Hello first.
        let hello =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, read_one_frame(&mut read_half)).await??;
        let (peer_node_id, link_address, peer_connector) = match hello {
            ClusterMessage::Hello {
                node_id: peer,
                version,
                address,
                connector,
            } => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(format!(
                        "protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )
                    .into());
                }
                (peer, address, connector)
            }
            other => return Err(format!("expected Hello, got {}", other.type_name()).into()),
        };

        info!(
            "Cluster acceptor: Link from node '{}' forwarding '{}'",
            peer_node_id, link_address
        );

        // The live link itself tells us how to reach the peer back.
        if let Some(pair) = peer_connector.to_pair() {
            topology.merge(&peer_node_id, pair, 0, false);
        }

        let ack = ClusterMessage::HelloAck {
            node_id: node_id.clone(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        write_half.write_all(&frame_message(&ack)?).await?;

        let entries: Vec<TopologyUpdate> = topology
            .snapshot()
            .iter()
            .map(TopologyUpdate::from_entry)
            .collect();
        let snapshot = ClusterMessage::TopologySnapshot { entries };
        write_half.write_all(&frame_message(&snapshot)?).await?;

        // Cumulative payload bytes processed on this link.
        let mut received_bytes: u64 = 0;
        let mut last_hint: Option<u32> = None;

        let mut hint_timer = tokio::time::interval(HINT_INTERVAL);
        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut buf_offset = 0usize;

        loop {
            tokio::select! {
                result = read_half.read(&mut read_buf[buf_offset..]) => {
                    let n = result?;
                    if n == 0 {
                        debug!("Cluster acceptor: Node '{}' disconnected", peer_node_id);
                        return Ok(());
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
                            Ok(ClusterMessage::Forward {
                                address,
                                payload,
                                hop_count,
                                duplicate_id,
                                sequence,
                            }) => {
                                let size = payload.len() as u64;

                                let accepted = match &duplicate_id {
                                    Some(id) => {
                                        filter.check_and_record(&address, id.clone())
                                            == DedupOutcome::Accepted
                                    }
                                    None => true,
                                };

                                if accepted {
                                    let message = Message {
                                        payload: Bytes::from(payload),
                                        hop_count: hop_count + 1,
                                        duplicate_id,
                                    };
                                    if let Err(e) = queue.enqueue(&address, message) {
                                        warn!(
                                            "Cluster acceptor: Dropped forward from '{}': {}",
                                            peer_node_id, e
                                        );
                                    }
                                } else {
                                    // A retransmit the application already saw;
                                    // confirm it like a delivery so the sender
                                    // stops resending.
                                    debug!(
                                        "Cluster acceptor: Duplicate from '{}' at sequence {} dropped",
                                        peer_node_id, sequence
                                    );
                                }

                                received_bytes += size;
                                let confirm = ClusterMessage::Confirm {
                                    confirmed_bytes: received_bytes,
                                };
                                write_half.write_all(&frame_message(&confirm)?).await?;
                            }
                            Ok(ClusterMessage::TopologySnapshot { entries }) => {
                                for entry in entries {
                                    if entry.node_id == node_id {
                                        continue;
                                    }
                                    if let Some(pair) = entry.connector.to_pair() {
                                        topology.merge(&entry.node_id, pair, entry.hops + 1, false);
                                    }
                                }
                            }
                            Ok(ClusterMessage::Ping) => {
                                write_half
                                    .write_all(&frame_message(&ClusterMessage::Pong)?)
                                    .await?;
                            }
                            Ok(ClusterMessage::Pong) => {}
                            Ok(ClusterMessage::Goodbye) => {
                                info!("Cluster acceptor: Node '{}' said goodbye", peer_node_id);
                                return Ok(());
                            }
                            Ok(other) => {
                                debug!(
                                    "Cluster acceptor: Unexpected {} from '{}' ignored",
                                    other.type_name(),
                                    peer_node_id
                                );
                            }
                            Err(e) => {
                                debug!("Cluster acceptor: Undecodable frame: {}", e);
                            }
                        }

                        read_buf.copy_within(4 + len..buf_offset, 0);
                        buf_offset -= 4 + len;
                    }
                }

                _ = hint_timer.tick() => {
                    let count = queue.consumer_count_hint(&link_address) as u32;
                    if last_hint != Some(count) {
                        last_hint = Some(count);
                        let hint = ClusterMessage::ConsumerCount {
                            address: link_address.clone(),
                            count,
                        };
                        write_half.write_all(&frame_message(&hint)?).await?;
                    }
                }

                _ = shutdown.notified() => {
                    let _ = write_half
                        .write_all(&frame_message(&ClusterMessage::Goodbye)?)
                        .await;
                    return Ok(());
                }
            }
        }
    }
}

async fn read_one_frame(
    read_half: &mut tokio::net::tcp::OwnedReadHalf,
) -> Result<ClusterMessage, Box<dyn std::error::Error + Send + Sync>> {
    let mut len_buf = [0u8; 4];
    read_half.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    read_half.read_exact(&mut payload).await?;

    Ok(ClusterMessage::decode(&payload)?)
}
