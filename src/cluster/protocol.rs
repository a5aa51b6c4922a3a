//! Cluster Protocol Messages
//!
//! Binary protocol for inter-broker links and UDP announcements.
//! Messages are serialized using bincode and framed with a u32 length
//! prefix on TCP.

use bincode::{Decode, Encode};

use crate::dedup::DuplicateId;
use crate::topology::TopologyEntry;
use crate::transport::ConnectorPair;

/// Protocol version for compatibility checking
pub const CLUSTER_PROTOCOL_VERSION: u8 = 1;

/// A named connector carried in announcements and handshakes.
///
/// Addresses travel as strings and are re-parsed on receipt; an entry
/// with an unparsable address is ignored by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ConnectorInfo {
    /// Connector name as configured on the announcing node
    pub name: String,
    /// Primary acceptor address
    pub address: String,
    /// Backup acceptor address
    pub backup: Option<String>,
}

impl ConnectorInfo {
    pub fn from_pair(name: impl Into<String>, pair: &ConnectorPair) -> Self {
        Self {
            name: name.into(),
            address: pair.address.to_string(),
            backup: pair.backup.map(|addr| addr.to_string()),
        }
    }

    /// Parse back into a connector pair; None if the address is invalid
    pub fn to_pair(&self) -> Option<ConnectorPair> {
        let address = self.address.parse().ok()?;
        let backup = match &self.backup {
            Some(backup) => Some(backup.parse().ok()?),
            None => None,
        };
        Some(ConnectorPair { address, backup })
    }
}

/// One node's announcement over the broadcast channel
#[derive(Debug, Clone, Encode, Decode)]
pub struct NodeAnnouncement {
    /// Announcing node
    pub node_id: String,
    /// Connectors the node can be reached at
    pub connectors: Vec<ConnectorInfo>,
    /// Announcement counter, advances every period
    pub sequence: u64,
}

impl NodeAnnouncement {
    /// Encode to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }
}

/// A topology entry relayed over a cluster link
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TopologyUpdate {
    /// Node the entry describes
    pub node_id: String,
    /// Connector the node was known at, as a parseable address
    pub connector: ConnectorInfo,
    /// Hop distance at which the sender knows the node
    pub hops: u32,
}

impl TopologyUpdate {
    pub fn from_entry(entry: &TopologyEntry) -> Self {
        Self {
            node_id: entry.node_id.clone(),
            connector: ConnectorInfo::from_pair("topology", &entry.connector),
            hops: entry.hops,
        }
    }
}

/// Messages exchanged between cluster nodes over TCP
#[derive(Debug, Clone, Encode, Decode)]
pub enum ClusterMessage {
    /// Handshake sent when a bridge connects
    Hello {
        /// Node ID of the sender
        node_id: String,
        /// Protocol version
        version: u8,
        /// Address the sending bridge forwards
        address: String,
        /// Connector the sending node can be reached back at
        connector: ConnectorInfo,
    },

    /// Handshake acknowledgment from the accepting side
    HelloAck {
        /// Node ID of the responder
        node_id: String,
        /// Protocol version
        version: u8,
    },

    /// The sender's current topology, relayed so multi-hop knowledge
    /// spreads through the mesh
    TopologySnapshot {
        /// Known nodes with their hop distances
        entries: Vec<TopologyUpdate>,
    },

    /// Forward a message to the peer
    Forward {
        /// Forwarding address the message belongs to
        address: String,
        /// Message payload
        payload: Vec<u8>,
        /// Forwards the message has already traversed
        hop_count: u32,
        /// Duplicate-detection identifier, when stamping is enabled
        duplicate_id: Option<DuplicateId>,
        /// Position in the sender's forwarding log
        sequence: u64,
    },

    /// Cumulative delivery confirmation: total payload bytes the peer
    /// has processed on this link
    Confirm {
        /// Monotonic byte watermark
        confirmed_bytes: u64,
    },

    /// Consumer-count hint for a forwarding address on the sending node
    ConsumerCount {
        /// Address the hint applies to
        address: String,
        /// Attached consumers
        count: u32,
    },

    /// Keep-alive ping
    Ping,

    /// Keep-alive pong
    Pong,

    /// Graceful disconnect notification
    Goodbye,
}

impl ClusterMessage {
    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "Hello",
            ClusterMessage::HelloAck { .. } => "HelloAck",
            ClusterMessage::TopologySnapshot { .. } => "TopologySnapshot",
            ClusterMessage::Forward { .. } => "Forward",
            ClusterMessage::Confirm { .. } => "Confirm",
            ClusterMessage::ConsumerCount { .. } => "ConsumerCount",
            ClusterMessage::Ping => "Ping",
            ClusterMessage::Pong => "Pong",
            ClusterMessage::Goodbye => "Goodbye",
        }
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(msg: &ClusterMessage) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = msg.encode()?;
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}
