//! Queue Engine Seam
//!
//! The cluster subsystem does not own message storage or consumer
//! matching; it pulls messages eligible for forwarding from a queue
//! engine and hands forwarded messages back to it. `MemoryQueueEngine`
//! is the in-process implementation used by the broker binary and the
//! test suite.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::dedup::DuplicateId;

/// A message moving through the broker.
#[derive(Debug, Clone)]
pub struct Message {
    /// Application payload
    pub payload: Bytes,
    /// Inter-broker forwards this message has traversed
    pub hop_count: u32,
    /// Sender-assigned duplicate-detection identifier, if stamped
    pub duplicate_id: Option<DuplicateId>,
}

impl Message {
    /// Create a locally produced message (hop count 0, unstamped)
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            hop_count: 0,
            duplicate_id: None,
        }
    }

    /// Payload size used for confirmation-window accounting
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Error enqueueing a message
#[derive(Debug)]
pub enum EnqueueError {
    /// The address has reached its queue capacity
    Full { address: String },
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full { address } => write!(f, "Queue full for address '{}'", address),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// The queueing engine as seen from the cluster subsystem.
///
/// `next_eligible` is a restartable pull: the caller owns the position
/// cursor and may rewind it (a bridge rewinds to its confirmed watermark
/// after a reconnect), so the engine must serve any retained position
/// again.
#[async_trait]
pub trait QueueEngine: Send + Sync {
    /// Wait for and return the message at `position` in the address's
    /// forwarding log, together with its position. Returns `None` only
    /// if the engine is shutting down.
    async fn next_eligible(&self, address: &str, position: u64) -> Option<(u64, Message)>;

    /// Deliver a message into the address
    fn enqueue(&self, address: &str, message: Message) -> Result<(), EnqueueError>;

    /// Number of consumers currently attached to the address, used to
    /// decide whether forwarding to a peer without consumers is useful
    fn consumer_count_hint(&self, address: &str) -> usize;
}

struct AddressQueue {
    log: RwLock<Vec<Message>>,
    notify: Notify,
    consumers: Mutex<Vec<mpsc::UnboundedSender<Message>>>,
}

impl AddressQueue {
    fn new() -> Self {
        Self {
            log: RwLock::new(Vec::new()),
            notify: Notify::new(),
            consumers: Mutex::new(Vec::new()),
        }
    }
}

/// In-memory queue engine: per-address append-only log plus fan-out to
/// attached consumers.
pub struct MemoryQueueEngine {
    addresses: DashMap<String, Arc<AddressQueue>>,
    capacity: usize,
}

impl MemoryQueueEngine {
    /// Default per-address log capacity
    pub const DEFAULT_CAPACITY: usize = 65536;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            addresses: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn address(&self, address: &str) -> Arc<AddressQueue> {
        self.addresses
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(AddressQueue::new()))
            .clone()
    }

    /// Attach a consumer to an address; delivered every message enqueued
    /// after the call. Dropping the receiver detaches the consumer.
    pub fn subscribe(&self, address: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.address(address).consumers.lock().push(tx);
        rx
    }

    /// Number of messages retained for an address
    pub fn len(&self, address: &str) -> usize {
        self.addresses
            .get(address)
            .map(|q| q.log.read().len())
            .unwrap_or(0)
    }
}

impl Default for MemoryQueueEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueEngine for MemoryQueueEngine {
    async fn next_eligible(&self, address: &str, position: u64) -> Option<(u64, Message)> {
        let queue = self.address(address);
        loop {
            let notified = queue.notify.notified();
            {
                let log = queue.log.read();
                if let Some(message) = log.get(position as usize) {
                    return Some((position, message.clone()));
                }
            }
            notified.await;
        }
    }

    fn enqueue(&self, address: &str, message: Message) -> Result<(), EnqueueError> {
        let queue = self.address(address);
        {
            let mut log = queue.log.write();
            if log.len() >= self.capacity {
                return Err(EnqueueError::Full {
                    address: address.to_string(),
                });
            }
            log.push(message.clone());
        }

        // Fan out to attached consumers, dropping the ones that went away.
        queue
            .consumers
            .lock()
            .retain(|tx| tx.send(message.clone()).is_ok());

        queue.notify.notify_waiters();
        Ok(())
    }

    fn consumer_count_hint(&self, address: &str) -> usize {
        self.addresses
            .get(address)
            .map(|q| {
                let mut consumers = q.consumers.lock();
                consumers.retain(|tx| !tx.is_closed());
                consumers.len()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_next_eligible_waits_for_messages() {
        let engine = Arc::new(MemoryQueueEngine::new());

        let pull = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.next_eligible("orders", 0).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.enqueue("orders", Message::new("hello")).unwrap();

        let (position, message) = pull.await.unwrap().unwrap();
        assert_eq!(position, 0);
        assert_eq!(message.payload, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_positions_are_replayable() {
        let engine = MemoryQueueEngine::new();
        engine.enqueue("a", Message::new("one")).unwrap();
        engine.enqueue("a", Message::new("two")).unwrap();

        let (_, first) = engine.next_eligible("a", 0).await.unwrap();
        let (_, again) = engine.next_eligible("a", 0).await.unwrap();
        assert_eq!(first.payload, again.payload);

        let (position, second) = engine.next_eligible("a", 1).await.unwrap();
        assert_eq!(position, 1);
        assert_eq!(second.payload, Bytes::from("two"));
    }

    #[tokio::test]
    async fn test_consumer_count_hint_tracks_subscribers() {
        let engine = MemoryQueueEngine::new();
        assert_eq!(engine.consumer_count_hint("a"), 0);

        let rx = engine.subscribe("a");
        assert_eq!(engine.consumer_count_hint("a"), 1);

        drop(rx);
        assert_eq!(engine.consumer_count_hint("a"), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_enqueued_messages() {
        let engine = MemoryQueueEngine::new();
        let mut rx = engine.subscribe("a");
        engine.enqueue("a", Message::new("payload")).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.payload, Bytes::from("payload"));
    }

    #[tokio::test]
    async fn test_enqueue_full() {
        let engine = MemoryQueueEngine::with_capacity(1);
        engine.enqueue("a", Message::new("one")).unwrap();
        assert!(engine.enqueue("a", Message::new("two")).is_err());
    }
}
