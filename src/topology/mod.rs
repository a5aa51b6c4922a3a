//! Cluster Topology
//!
//! Process-wide map of known broker nodes: for each node id the
//! best-known connector pair and the hop distance at which it was
//! learned. Entries arrive from direct discovery (hops 0) and from
//! topology snapshots relayed over cluster links.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::transport::ConnectorPair;

/// One known node: its best-known connector and hop distance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyEntry {
    /// Node identifier
    pub node_id: String,
    /// Best-known connector for the node
    pub connector: ConnectorPair,
    /// Inter-broker forwards this fact traversed (0 = directly discovered)
    pub hops: u32,
}

#[derive(Debug, Clone)]
struct EntryState {
    connector: ConnectorPair,
    hops: u32,
}

/// Shared node map with lowest-hop-wins merge semantics.
///
/// A flat mapping with explicit hop metadata: cycles in the mesh never
/// need detecting because an entry is only accepted when it lowers the
/// known hop count (direct discovery breaking ties), and never above
/// the `max_hops` ceiling. Hop counts are monotonically non-increasing
/// for the lifetime of an entry.
pub struct Topology {
    local_node_id: String,
    max_hops: u32,
    entries: DashMap<String, EntryState>,
}

impl Topology {
    /// Create an empty topology for this node
    pub fn new(local_node_id: impl Into<String>, max_hops: u32) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            max_hops,
            entries: DashMap::new(),
        }
    }

    /// The node id this topology belongs to
    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    /// Merge a node sighting. Returns true if the map changed.
    ///
    /// Accepted only when `hops <= max_hops` and the entry is new,
    /// strictly closer, or a direct sighting at the same distance
    /// (direct discovery wins ties against hop-propagated data).
    /// Self-references are always dropped.
    pub fn merge(
        &self,
        node_id: &str,
        connector: ConnectorPair,
        hops: u32,
        direct: bool,
    ) -> bool {
        if node_id == self.local_node_id || hops > self.max_hops {
            return false;
        }

        match self.entries.entry(node_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                let closer = hops < existing.hops;
                // Direct sightings win ties, and may refresh the
                // connector of a node that came back on a new address.
                let direct_tie = direct && hops == existing.hops;
                if closer || (direct_tie && existing.connector != connector) {
                    occupied.insert(EntryState { connector, hops });
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(EntryState { connector, hops });
                true
            }
        }
    }

    /// Drop a node (on node-left). Returns true if an entry was removed.
    pub fn remove(&self, node_id: &str) -> bool {
        self.entries.remove(node_id).is_some()
    }

    /// Look up the connector and hop distance for a node
    pub fn get(&self, node_id: &str) -> Option<TopologyEntry> {
        self.entries.get(node_id).map(|e| TopologyEntry {
            node_id: node_id.to_string(),
            connector: e.connector.clone(),
            hops: e.hops,
        })
    }

    /// Snapshot of all known nodes, for diagnostics and for relaying to
    /// peers over cluster links.
    pub fn snapshot(&self) -> Vec<TopologyEntry> {
        self.entries
            .iter()
            .map(|e| TopologyEntry {
                node_id: e.key().clone(),
                connector: e.value().connector.clone(),
                hops: e.value().hops,
            })
            .collect()
    }

    /// Number of known nodes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no nodes are known
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
