//! Fan-out of encoder output to every connected subscriber.
//!
//! Subscribers come and go independently of the stream: a subscriber that
//! joins mid-stream only sees chunks emitted after it joined, and the last one
//! leaving does not stop the encoder.

pub mod server;

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::protocol::ServerEvent;

pub type SubscriberId = u64;

/// One message queued for a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Chunk { seq: u64, data: Bytes },
    Event(ServerEvent),
}

type SubscriberMap = Arc<RwLock<HashMap<SubscriberId, mpsc::UnboundedSender<RelayFrame>>>>;

#[derive(Clone, Default)]
pub struct ChunkRelay {
    subscribers: SubscriberMap,
    next_id: Arc<AtomicU64>,
    next_seq: Arc<AtomicU64>,
}

impl ChunkRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<RelayFrame>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().await.insert(id, tx);
        debug!("Subscriber {} joined", id);
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: SubscriberId) {
        if self.subscribers.write().await.remove(&id).is_some() {
            debug!("Subscriber {} left", id);
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Relay one encoder chunk. Chunks must be fed in emission order; each gets
    /// the next sequence number. Returns how many subscribers it was queued for.
    pub async fn broadcast_chunk(&self, data: Bytes) -> usize {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.broadcast(RelayFrame::Chunk { seq, data }).await
    }

    pub async fn broadcast_event(&self, event: ServerEvent) -> usize {
        self.broadcast(RelayFrame::Event(event)).await
    }

    async fn broadcast(&self, frame: RelayFrame) -> usize {
        // Snapshot, then send without holding the lock.
        let targets: Vec<_> = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, tx) in targets {
            if tx.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                gone.push(id);
            }
        }

        if !gone.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in gone {
                subscribers.remove(&id);
            }
        }
        delivered
    }
}
