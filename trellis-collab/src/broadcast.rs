//! Fan-out broadcast to N-1 peers with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each subscriber buffers up to `capacity` messages; envelopes carry the
//! origin peer so a subscriber never sees its own messages echoed back.
//! A subscriber that falls behind is told how many messages it missed so the
//! caller can resynchronize it with a full state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Pre-encoded message tagged with the peer that caused it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub subscribers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    ///
    /// `capacity` determines how many messages can be buffered per peer
    /// before lagging peers start missing messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Subscribe on behalf of `peer_id`.
    pub fn subscribe(&self, peer_id: Uuid) -> Subscriber {
        Subscriber {
            peer_id,
            receiver: self.sender.subscribe(),
            stats: self.stats.clone(),
        }
    }

    /// Encode and send `msg` to every subscriber except `origin`.
    ///
    /// Returns the number of receivers that got the envelope (the origin's
    /// own receiver included, it filters on receipt).
    pub fn broadcast(&self, origin: Uuid, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(origin, Arc::new(encoded)))
    }

    /// Send pre-encoded bytes. Never blocks; with no subscribers this is a no-op.
    pub fn broadcast_raw(&self, origin: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Envelope { origin, bytes }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Arc<Vec<u8>>),
    /// `n` envelopes were dropped because this subscriber fell behind.
    Lagged(u64),
}

/// Receiving side of a [`BroadcastGroup`] for one peer.
pub struct Subscriber {
    peer_id: Uuid,
    receiver: broadcast::Receiver<Envelope>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Subscriber {
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Next envelope from another peer; `None` once the group is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.origin == self.peer_id => continue,
                Ok(envelope) => return Some(Inbound::Message(envelope.bytes)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.messages_lagged.fetch_add(n, Ordering::Relaxed);
                    log::warn!("Peer {} lagged by {} messages", self.peer_id, n);
                    return Some(Inbound::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
