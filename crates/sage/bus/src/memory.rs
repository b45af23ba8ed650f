//! In-memory broadcast bus

use crate::message::{BusMessage, Topic};
use crate::GovernanceBus;
use async_trait::async_trait;
use sage_types::BusResult;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// Broadcast-channel bus for tests, demos and single-process fleets
pub struct InMemoryBus {
    channels: [broadcast::Sender<BusMessage>; Topic::ALL.len()],
    published: AtomicU64,
}

impl InMemoryBus {
    /// Create a bus with the default per-topic capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with an explicit per-topic channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: std::array::from_fn(|_| broadcast::channel(capacity).0),
            published: AtomicU64::new(0),
        }
    }

    /// Subscribe to one topic
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<BusMessage> {
        self.channels[topic.index()].subscribe()
    }

    /// Get statistics
    pub fn stats(&self) -> BusStats {
        BusStats {
            total_published: self.published.load(Ordering::Relaxed),
            subscribers_by_topic: Topic::ALL
                .map(|topic| (topic, self.channels[topic.index()].receiver_count())),
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GovernanceBus for InMemoryBus {
    async fn publish(&self, message: BusMessage) -> BusResult<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        // A topic with no subscribers drops the message; that is not a
        // delivery failure for a broadcast channel.
        let _ = self.channels[message.topic().index()].send(message);
        Ok(())
    }
}

/// Bus statistics
#[derive(Clone, Debug)]
pub struct BusStats {
    /// Total messages published across all topics
    pub total_published: u64,
    /// Active subscriber count per topic
    pub subscribers_by_topic: [(Topic, usize); Topic::ALL.len()],
}
