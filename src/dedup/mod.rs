//! Duplicate Detection
//!
//! Remembers recently seen message identifiers per forwarding address so
//! that redelivery after a cluster-link reconnect never produces a second
//! application-visible copy. The window per address is bounded: once full,
//! the oldest identifier is evicted, so a duplicate can slip through only
//! after falling out of the retention window. False positives never occur.

use std::collections::{HashSet, VecDeque};

use ahash::RandomState;
use bincode::{Decode, Encode};
use dashmap::DashMap;
use parking_lot::Mutex;

/// Sender-assigned identifier attached to forwarded messages.
///
/// Deterministic for a given message: the origin node id plus the
/// message's sequence in the origin's forwarding log, so a retransmit
/// after reconnect carries the same identifier as the original send.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode)]
pub struct DuplicateId {
    /// Node that first stamped the message
    pub origin: String,
    /// Position in the origin's forwarding log
    pub sequence: u64,
}

impl DuplicateId {
    pub fn new(origin: impl Into<String>, sequence: u64) -> Self {
        Self {
            origin: origin.into(),
            sequence,
        }
    }
}

/// Result of a check-and-record operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First sighting within the retention window; the id is now recorded
    Accepted,
    /// Already seen; the message must be dropped, not enqueued
    Duplicate,
}

struct AddressWindow {
    seen: HashSet<DuplicateId, RandomState>,
    order: VecDeque<DuplicateId>,
}

impl AddressWindow {
    fn new() -> Self {
        Self {
            seen: HashSet::default(),
            order: VecDeque::new(),
        }
    }
}

/// Per-address bounded record of recently seen message identifiers.
///
/// Shared by every link delivering to an address; check-and-record is
/// atomic per address, so two concurrent calls can never both observe
/// "not a duplicate" for the same identifier.
pub struct DuplicateDetectionFilter {
    capacity: usize,
    addresses: DashMap<String, Mutex<AddressWindow>, RandomState>,
}

impl DuplicateDetectionFilter {
    /// Create a filter retaining up to `capacity` identifiers per address
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            addresses: DashMap::default(),
        }
    }

    /// Test and record an identifier for an address.
    ///
    /// Returns `Accepted` exactly once per identifier while it remains
    /// within the retention window, `Duplicate` on every later sighting.
    pub fn check_and_record(&self, address: &str, id: DuplicateId) -> DedupOutcome {
        let window = self
            .addresses
            .entry(address.to_string())
            .or_insert_with(|| Mutex::new(AddressWindow::new()));
        let mut window = window.lock();

        if window.seen.contains(&id) {
            return DedupOutcome::Duplicate;
        }

        if window.order.len() >= self.capacity {
            if let Some(oldest) = window.order.pop_front() {
                window.seen.remove(&oldest);
            }
        }
        window.order.push_back(id.clone());
        window.seen.insert(id);
        DedupOutcome::Accepted
    }

    /// Number of identifiers currently retained for an address
    pub fn recorded(&self, address: &str) -> usize {
        self.addresses
            .get(address)
            .map(|w| w.lock().order.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_then_duplicate() {
        let filter = DuplicateDetectionFilter::new(16);
        let id = DuplicateId::new("node-a", 1);
        assert_eq!(
            filter.check_and_record("orders", id.clone()),
            DedupOutcome::Accepted
        );
        assert_eq!(
            filter.check_and_record("orders", id),
            DedupOutcome::Duplicate
        );
    }

    #[test]
    fn test_addresses_are_independent() {
        let filter = DuplicateDetectionFilter::new(16);
        let id = DuplicateId::new("node-a", 1);
        assert_eq!(
            filter.check_and_record("orders", id.clone()),
            DedupOutcome::Accepted
        );
        assert_eq!(
            filter.check_and_record("invoices", id),
            DedupOutcome::Accepted
        );
    }

    #[test]
    fn test_eviction_after_capacity() {
        let filter = DuplicateDetectionFilter::new(2);
        filter.check_and_record("a", DuplicateId::new("n", 1));
        filter.check_and_record("a", DuplicateId::new("n", 2));
        filter.check_and_record("a", DuplicateId::new("n", 3));
        assert_eq!(filter.recorded("a"), 2);

        // Oldest id was evicted, so it is treated as new again.
        assert_eq!(
            filter.check_and_record("a", DuplicateId::new("n", 1)),
            DedupOutcome::Accepted
        );
        // Non-evicted ids are still recognized.
        assert_eq!(
            filter.check_and_record("a", DuplicateId::new("n", 3)),
            DedupOutcome::Duplicate
        );
    }

    #[test]
    fn test_concurrent_check_and_record_admits_once() {
        use std::sync::Arc;

        let filter = Arc::new(DuplicateDetectionFilter::new(1024));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let filter = filter.clone();
            handles.push(std::thread::spawn(move || {
                let mut accepted = 0;
                for seq in 0..100 {
                    let id = DuplicateId::new("n", seq);
                    if filter.check_and_record("a", id) == DedupOutcome::Accepted {
                        accepted += 1;
                    }
                }
                accepted
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
    }
}
