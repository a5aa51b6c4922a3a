//! Cluster Integration Tests
//!
//! Exercises discovery, bridging, flow control, and duplicate-protected
//! redelivery between nodes over real sockets.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use meshmq::broadcast::{BroadcastGroup, LocalBroadcastBus};
use meshmq::cluster::protocol::{
    frame_message, ClusterMessage, CLUSTER_PROTOCOL_VERSION,
};
use meshmq::cluster::{BridgeEvent, BridgeState, ClusterAcceptor, ClusterBridge, ClusterConnection};
use meshmq::config::ClusterConnectionConfig;
use meshmq::dedup::{DedupOutcome, DuplicateDetectionFilter, DuplicateId};
use meshmq::discovery::DiscoveryGroup;
use meshmq::queue::{MemoryQueueEngine, Message, QueueEngine};
use meshmq::topology::Topology;
use meshmq::transport::ConnectorPair;
use meshmq::BrokerNode;

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(23000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn connector(port: u16) -> ConnectorPair {
    ConnectorPair::new(format!("127.0.0.1:{}", port).parse().unwrap())
}

/// Cluster connection config used by most tests
fn test_connection_config(name: &str) -> ClusterConnectionConfig {
    ClusterConnectionConfig {
        name: name.to_string(),
        address: "orders".to_string(),
        connector_name: "cluster".to_string(),
        retry_interval: Duration::from_millis(100),
        max_retry_interval: Duration::from_secs(1),
        discovery_group: Some("dg".to_string()),
        ..Default::default()
    }
}

/// One receiving node: queue engine, topology, acceptor bound to an
/// ephemeral port.
struct TestNode {
    queue: Arc<MemoryQueueEngine>,
    topology: Arc<Topology>,
    acceptor: ClusterAcceptor,
    port: u16,
}

impl TestNode {
    async fn start(node_id: &str, max_hops: u32) -> Self {
        let queue = Arc::new(MemoryQueueEngine::new());
        let topology = Arc::new(Topology::new(node_id, max_hops));
        let filter = Arc::new(DuplicateDetectionFilter::new(1024));
        let acceptor = ClusterAcceptor::new(
            node_id,
            topology.clone(),
            queue.clone(),
            filter,
        );
        let addr = acceptor
            .start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        Self {
            queue,
            topology,
            acceptor,
            port: addr.port(),
        }
    }

    async fn stop(&self) {
        self.acceptor.stop().await;
    }
}

/// Scripted peer standing in for a remote broker, so tests can control
/// exactly when confirmations happen.
struct TestLink {
    stream: TcpStream,
}

impl TestLink {
    /// Accept one link and complete the handshake as `node_id`
    async fn accept(listener: &TcpListener, node_id: &str) -> Self {
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("no inbound link")
            .unwrap();
        let mut link = Self { stream };

        match link.read_message().await {
            ClusterMessage::Hello { version, .. } => {
                assert_eq!(version, CLUSTER_PROTOCOL_VERSION);
            }
            other => panic!("Expected Hello, got {}", other.type_name()),
        }
        link.send(&ClusterMessage::HelloAck {
            node_id: node_id.to_string(),
            version: CLUSTER_PROTOCOL_VERSION,
        })
        .await;
        link
    }

    async fn send(&mut self, msg: &ClusterMessage) {
        let frame = frame_message(msg).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn read_message(&mut self) -> ClusterMessage {
        let mut len_buf = [0u8; 4];
        timeout(Duration::from_secs(5), self.stream.read_exact(&mut len_buf))
            .await
            .expect("read timed out")
            .unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await.unwrap();
        ClusterMessage::decode(&payload).unwrap()
    }

    /// Next Forward frame, skipping keep-alive and topology traffic
    async fn next_forward(&mut self) -> (u64, Vec<u8>, Option<DuplicateId>) {
        loop {
            match self.read_message().await {
                ClusterMessage::Forward {
                    payload,
                    duplicate_id,
                    sequence,
                    ..
                } => return (sequence, payload, duplicate_id),
                ClusterMessage::Ping => self.send(&ClusterMessage::Pong).await,
                _ => {}
            }
        }
    }

    /// Expect silence: no Forward frame within `wait`
    async fn assert_no_forward(&mut self, wait: Duration) {
        let result = timeout(wait, self.next_forward()).await;
        assert!(result.is_err(), "unexpected forward: {:?}", result);
    }
}

async fn poll_until<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let start = tokio::time::Instant::now();
    loop {
        if check() {
            return;
        }
        if start.elapsed() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// =============================================================================
// Discovery-driven bridge lifecycle
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_discovered_node_appears_in_node_map() {
    let bus = LocalBroadcastBus::new();

    // Receiving node with an acceptor and a broadcast group advertising it.
    let node_b = TestNode::start("node-b", 1).await;
    let broadcast_b = BroadcastGroup::new(
        "bg",
        "node-b",
        Duration::from_millis(250),
        Arc::new(bus.clone()),
    );
    broadcast_b.add_connector("cluster", connector(node_b.port));

    // Observing node: discovery plus a cluster connection.
    let topology_a = Arc::new(Topology::new("node-a", 1));
    let queue_a = Arc::new(MemoryQueueEngine::new());
    let discovery_a = Arc::new(DiscoveryGroup::new(
        "dg",
        "node-a",
        Duration::from_millis(500),
        Duration::from_millis(100),
        Arc::new(bus.clone()),
    ));
    discovery_a.start().await.unwrap();

    let connection_a = ClusterConnection::new(
        test_connection_config("cluster"),
        "node-a",
        connector(next_port()),
        topology_a,
        queue_a,
        Some(discovery_a.clone()),
    )
    .unwrap();
    connection_a.start().await.unwrap();

    assert!(connection_a.is_started());
    assert_eq!(connection_a.nodes().len(), 0);

    // The peer begins announcing; it must show up in the node map with
    // its acceptor port.
    broadcast_b.start().await.unwrap();

    poll_until("node map entry", Duration::from_secs(30), || {
        connection_a.nodes().len() == 1
    })
    .await;
    let nodes = connection_a.nodes();
    let remote_address = nodes.values().next().unwrap();
    assert!(
        remote_address.ends_with(&format!(":{}", node_b.port)),
        "{} does not end with :{}",
        remote_address,
        node_b.port
    );

    poll_until("bridge forwarding", Duration::from_secs(10), || {
        connection_a
            .bridge_states()
            .iter()
            .any(|(_, state)| *state == BridgeState::Forwarding)
    })
    .await;

    // The peer stops announcing; expiry must tear the bridge down.
    broadcast_b.stop().await;
    poll_until("node map drained", Duration::from_secs(10), || {
        connection_a.nodes().is_empty() && connection_a.bridge_states().is_empty()
    })
    .await;

    connection_a.stop().await;
    assert!(!connection_a.is_started());
    discovery_a.stop().await;
    node_b.stop().await;
}

// =============================================================================
// End-to-end forwarding
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forwarding_end_to_end_with_static_connector() {
    let node_b = TestNode::start("node-b", 1).await;
    let mut inbound_b = node_b.queue.subscribe("orders");

    let topology_a = Arc::new(Topology::new("node-a", 1));
    let queue_a = Arc::new(MemoryQueueEngine::new());
    let config = ClusterConnectionConfig {
        discovery_group: None,
        static_connectors: vec![format!("127.0.0.1:{}", node_b.port)],
        ..test_connection_config("cluster")
    };
    let connection_a = ClusterConnection::new(
        config,
        "node-a",
        connector(next_port()),
        topology_a,
        queue_a.clone(),
        None,
    )
    .unwrap();
    connection_a.start().await.unwrap();

    for i in 0..3u8 {
        queue_a
            .enqueue("orders", Message::new(vec![i; 16]))
            .unwrap();
    }

    for i in 0..3u8 {
        let message = timeout(Duration::from_secs(5), inbound_b.recv())
            .await
            .expect("forwarded message missing")
            .unwrap();
        assert_eq!(message.payload.as_ref(), &[i; 16][..]);
        // One forward happened, and the sender stamped an identifier.
        assert_eq!(message.hop_count, 1);
        let id = message.duplicate_id.expect("missing duplicate id");
        assert_eq!(id.origin, "node-a");
        assert_eq!(id.sequence, i as u64);
    }

    connection_a.stop().await;
    node_b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_message_at_hop_ceiling_is_not_reforwarded() {
    // Chain: A -> B -> C, every connection with max_hops = 1.
    let node_c = TestNode::start("node-c", 1).await;
    let mut inbound_c = node_c.queue.subscribe("orders");

    let node_b = TestNode::start("node-b", 1).await;
    let mut inbound_b = node_b.queue.subscribe("orders");

    // B forwards its "orders" address toward C.
    let config_bc = ClusterConnectionConfig {
        discovery_group: None,
        static_connectors: vec![format!("127.0.0.1:{}", node_c.port)],
        forward_when_no_consumers: true,
        ..test_connection_config("b-to-c")
    };
    let connection_b = ClusterConnection::new(
        config_bc,
        "node-b",
        connector(node_b.port),
        node_b.topology.clone(),
        node_b.queue.clone(),
        None,
    )
    .unwrap();
    connection_b.start().await.unwrap();

    // A forwards toward B.
    let topology_a = Arc::new(Topology::new("node-a", 1));
    let queue_a = Arc::new(MemoryQueueEngine::new());
    let config_ab = ClusterConnectionConfig {
        discovery_group: None,
        static_connectors: vec![format!("127.0.0.1:{}", node_b.port)],
        forward_when_no_consumers: true,
        ..test_connection_config("a-to-b")
    };
    let connection_a = ClusterConnection::new(
        config_ab,
        "node-a",
        connector(next_port()),
        topology_a,
        queue_a.clone(),
        None,
    )
    .unwrap();
    connection_a.start().await.unwrap();

    // A locally produced message at B travels one hop to C fine.
    node_b
        .queue
        .enqueue("orders", Message::new(&b"local-at-b"[..]))
        .unwrap();
    let at_c = timeout(Duration::from_secs(5), inbound_c.recv())
        .await
        .expect("chain b->c broken")
        .unwrap();
    assert_eq!(at_c.payload.as_ref(), b"local-at-b");

    // A message from A arrives at B with hop count 1 and must stop there.
    queue_a
        .enqueue("orders", Message::new(&b"from-a"[..]))
        .unwrap();
    let at_b = timeout(Duration::from_secs(5), inbound_b.recv())
        .await
        .expect("chain a->b broken")
        .unwrap();
    assert_eq!(at_b.payload.as_ref(), b"from-a");
    assert_eq!(at_b.hop_count, 1);

    // Nothing further may reach C.
    let extra = timeout(Duration::from_millis(500), inbound_c.recv()).await;
    assert!(extra.is_err(), "message crossed the hop ceiling: {:?}", extra);

    connection_a.stop().await;
    connection_b.stop().await;
    node_b.stop().await;
    node_c.stop().await;
}

// =============================================================================
// Flow control
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_confirmation_window_backpressure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap();

    let queue = Arc::new(MemoryQueueEngine::new());
    let topology = Arc::new(Topology::new("node-a", 1));
    let config = Arc::new(ClusterConnectionConfig {
        confirmation_window_size: 1024,
        discovery_group: None,
        static_connectors: vec![peer_addr.to_string()],
        ..test_connection_config("cluster")
    });
    let (events_tx, _events_rx) = mpsc::unbounded_channel::<BridgeEvent>();

    let bridge = ClusterBridge::new(
        peer_addr.to_string(),
        ConnectorPair::new(peer_addr),
        "node-a",
        connector(next_port()),
        config,
    )
    .spawn(
        queue.clone() as Arc<dyn QueueEngine>,
        topology,
        events_tx,
    );

    let mut link = TestLink::accept(&listener, "node-b").await;

    for _ in 0..8 {
        queue
            .enqueue("orders", Message::new(vec![0u8; 256]))
            .unwrap();
    }

    // 4 x 256 bytes fills the window exactly; the bridge must then stall.
    for expected in 0..4u64 {
        let (sequence, payload, _) = link.next_forward().await;
        assert_eq!(sequence, expected);
        assert_eq!(payload.len(), 256);
    }
    link.assert_no_forward(Duration::from_millis(400)).await;

    // Confirming one message reopens the window for exactly one more.
    link.send(&ClusterMessage::Confirm {
        confirmed_bytes: 256,
    })
    .await;
    let (sequence, _, _) = link.next_forward().await;
    assert_eq!(sequence, 4);
    link.assert_no_forward(Duration::from_millis(400)).await;

    // Confirming everything lets the rest drain.
    link.send(&ClusterMessage::Confirm {
        confirmed_bytes: 1280,
    })
    .await;
    for expected in 5..8u64 {
        let (sequence, _, _) = link.next_forward().await;
        assert_eq!(sequence, expected);
    }

    bridge.stop().await;
}

// =============================================================================
// Reconnect and duplicate protection
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_retransmits_only_unconfirmed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap();

    let queue = Arc::new(MemoryQueueEngine::new());
    let topology = Arc::new(Topology::new("node-a", 1));
    let config = Arc::new(ClusterConnectionConfig {
        discovery_group: None,
        static_connectors: vec![peer_addr.to_string()],
        ..test_connection_config("cluster")
    });
    let (events_tx, _events_rx) = mpsc::unbounded_channel::<BridgeEvent>();

    let bridge = ClusterBridge::new(
        peer_addr.to_string(),
        ConnectorPair::new(peer_addr),
        "node-a",
        connector(next_port()),
        config,
    )
    .spawn(
        queue.clone() as Arc<dyn QueueEngine>,
        topology,
        events_tx,
    );

    // The receiving side's filter: what converts at-least-once
    // redelivery into effectively-once.
    let filter = DuplicateDetectionFilter::new(1024);
    let mut enqueued = 0usize;

    let mut link = TestLink::accept(&listener, "node-b").await;

    for i in 0..5u8 {
        queue
            .enqueue("orders", Message::new(vec![i; 100]))
            .unwrap();
    }

    let mut first_ids = Vec::new();
    for _ in 0..5 {
        let (_, _, id) = link.next_forward().await;
        let id = id.expect("missing duplicate id");
        if filter.check_and_record("orders", id.clone()) == DedupOutcome::Accepted {
            enqueued += 1;
        }
        first_ids.push(id);
    }

    // Confirm the first two messages, give the bridge a moment to see
    // it, then kill the link mid-stream.
    link.send(&ClusterMessage::Confirm {
        confirmed_bytes: 200,
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(link);

    // The bridge reconnects and resends from its confirmed watermark.
    let mut link = TestLink::accept(&listener, "node-b").await;
    let mut resent = Vec::new();
    loop {
        let (sequence, _, id) = link.next_forward().await;
        let id = id.expect("missing duplicate id");
        if filter.check_and_record("orders", id.clone()) == DedupOutcome::Accepted {
            enqueued += 1;
        }
        resent.push((sequence, id));
        if sequence == 4 {
            break;
        }
    }

    // The unconfirmed suffix came back, with identifiers identical to
    // the first transmission.
    assert!(resent[0].0 <= 2, "unconfirmed message skipped on reconnect");
    for (sequence, id) in &resent {
        assert_eq!(*id, first_ids[*sequence as usize]);
    }

    // And the filter let each message through exactly once.
    assert_eq!(enqueued, 5);
    link.assert_no_forward(Duration::from_millis(400)).await;

    bridge.stop().await;
}

// =============================================================================
// Two-node cluster over UDP multicast
// =============================================================================

/// The full UDP discovery scenario: two broker nodes on one host find
/// each other through 231.7.7.7:9876 and the node map converges.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires a multicast-capable network"]
async fn test_two_node_cluster_via_udp_discovery() {
    let port_a = next_port();
    let port_b = next_port();

    let node_config = |id: &str, port: u16| {
        format!(
            r#"
[node]
id = "{id}"
cluster_bind = "127.0.0.1:{port}"

[node.connector.cluster]
address = "127.0.0.1:{port}"

[[broadcast_group]]
name = "bg"
broadcast_period = "250ms"
connector_names = ["cluster"]
group_address = "231.7.7.7"
group_port = 9876

[[discovery_group]]
name = "dg"
refresh_timeout = "10s"
initial_wait_timeout = "0s"
group_address = "231.7.7.7"
group_port = 9876

[[cluster_connection]]
name = "cluster"
address = "orders"
connector_name = "cluster"
retry_interval = "1s"
max_hops = 1
confirmation_window_size = 1024
discovery_group = "dg"
"#
        )
    };

    let config_a = meshmq::Config::parse(&node_config("node-a", port_a)).unwrap();
    let config_b = meshmq::Config::parse(&node_config("node-b", port_b)).unwrap();

    let node_a = BrokerNode::new(config_a).unwrap();
    node_a.start().await.unwrap();

    let control_a = node_a.cluster_connection("cluster").unwrap().clone();
    assert!(control_a.is_started());
    assert_eq!(control_a.nodes().len(), 0);

    let node_b = BrokerNode::new(config_b).unwrap();
    node_b.start().await.unwrap();

    poll_until("node map convergence", Duration::from_secs(30), || {
        control_a.nodes().len() == 1
    })
    .await;

    let nodes = control_a.nodes();
    let remote_address = nodes.values().next().unwrap();
    assert!(remote_address.ends_with(&format!(":{}", port_b)));

    node_b.stop().await;
    node_a.stop().await;
}
