//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Room join and delta send/receive
//! - Offline queue for edits made while disconnected
//!
//! The client does no merging itself; it surfaces [`SyncEvent`]s for a
//! [`DiagramSession`](crate::session::DiagramSession) to consume. Whatever
//! the session returns from `handle_event` goes back through [`SyncClient::send`];
//! after a reconnect that reply carries the edits the server never received.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{Departure, MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Default capacity of the offline queue.
pub const DEFAULT_OFFLINE_CAPACITY: usize = 10_000;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established and `Join` sent
    Connected,
    /// Connection lost
    Disconnected,
    /// Full room state, sent by the server after `Join` or after lagging
    RoomState(Vec<u8>),
    /// A delta from another connection
    RemoteDelta {
        peer_id: Uuid,
        clock: u64,
        payload: Vec<u8>,
    },
    PeerJoined(PeerInfo),
    PeerLeft(Departure),
    Pong,
}

impl SyncEvent {
    /// Map a server frame to an event. Client-only message types yield `None`.
    pub fn from_message(msg: SyncMessage) -> Result<Option<Self>, ProtocolError> {
        let event = match msg.msg_type {
            MessageType::RoomState => Some(SyncEvent::RoomState(msg.payload)),
            MessageType::Delta => Some(SyncEvent::RemoteDelta {
                peer_id: msg.peer_id,
                clock: msg.clock,
                payload: msg.payload,
            }),
            MessageType::PeerJoined => Some(SyncEvent::PeerJoined(msg.peer_info()?)),
            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(msg.departure()?)),
            MessageType::Pong => Some(SyncEvent::Pong),
            MessageType::Join | MessageType::Ping => None,
        };
        Ok(event)
    }
}

/// Offline queue for edits made while disconnected.
///
/// Queued deltas are replayed, oldest first, right after the next `Join`.
pub struct OfflineQueue {
    queue: VecDeque<QueuedDelta>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedDelta {
    clock: u64,
    payload: Vec<u8>,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue a delta for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedDelta {
            clock,
            payload,
            queued_at: Instant::now(),
        });
        true
    }

    /// Drain all queued deltas for replay.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|d| (d.clock, d.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total payload bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|d| d.payload.len()).sum()
    }

    /// How long the oldest queued delta has been waiting.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.queue.front().map(|d| d.queued_at.elapsed())
    }
}

/// The sync client.
///
/// Manages one WebSocket connection to the server for one room.
pub struct SyncClient {
    peer_info: PeerInfo,
    room_id: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Bumped on every connect so a stale reader cannot clobber `state`.
    epoch: Arc<AtomicU64>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// `server_url` is the base, e.g. `ws://127.0.0.1:9090`; the room id is
    /// appended as the path.
    pub fn new(peer_info: PeerInfo, room_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self::with_queue_capacity(peer_info, room_id, server_url, DEFAULT_OFFLINE_CAPACITY)
    }

    pub fn with_queue_capacity(
        peer_info: PeerInfo,
        room_id: impl Into<String>,
        server_url: impl Into<String>,
        queue_capacity: usize,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_info,
            room_id: room_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            epoch: Arc::new(AtomicU64::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(queue_capacity))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the room and replay the offline queue.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.write().await;
            *state = match *state {
                ConnectionState::Disconnected if self.epoch.load(Ordering::SeqCst) > 0 => {
                    ConnectionState::Reconnecting
                }
                _ => ConnectionState::Connecting,
            };
        }

        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), self.room_id);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {url}: {e}");
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel, close when it is dropped.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if let Err(e) = ws_writer.send(Message::Binary(data.into())).await {
                    // Frames still queued here are lost; the session resends
                    // them when it answers the next RoomState.
                    log::warn!("WebSocket write failed: {e}");
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        let join = SyncMessage::join(&self.room_id, &self.peer_info)?.encode()?;
        out_tx
            .send(join)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued deltas", queued.len());
        }
        for (clock, payload) in queued {
            let msg = SyncMessage::delta(self.peer_info.peer_id, &self.room_id, clock, payload);
            out_tx
                .send(msg.encode()?)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: decode server frames into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let current_epoch = self.epoch.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let event = SyncMessage::decode(&data).and_then(SyncEvent::from_message);
                        match event {
                            Ok(Some(evt)) => {
                                if event_tx.send(evt).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            if current_epoch.load(Ordering::SeqCst) == epoch {
                *state.write().await = ConnectionState::Disconnected;
            }
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. Deltas sent afterwards are queued.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send a delta, or queue it if there is no live connection.
    pub async fn send_delta(&self, clock: u64, payload: Vec<u8>) -> Result<(), ProtocolError> {
        let connected = *self.state.read().await == ConnectionState::Connected;
        if let (true, Some(tx)) = (connected, self.outgoing_tx.as_ref()) {
            let msg = SyncMessage::delta(self.peer_info.peer_id, &self.room_id, clock, payload);
            match tx.send(msg.encode()?).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(frame)) => {
                    // Writer is gone; recover the payload and fall through to the queue.
                    let msg = SyncMessage::decode(&frame)?;
                    return self.enqueue(msg.clock, msg.payload).await;
                }
            }
        }
        self.enqueue(clock, payload).await
    }

    async fn enqueue(&self, clock: u64, payload: Vec<u8>) -> Result<(), ProtocolError> {
        if self.offline_queue.lock().await.enqueue(clock, payload) {
            Ok(())
        } else {
            log::error!("Offline queue full; dropping delta {clock}");
            Err(ProtocolError::ConnectionClosed)
        }
    }

    /// Send any protocol message. Deltas fall back to the offline queue;
    /// anything else fails while disconnected.
    pub async fn send(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        if msg.msg_type == MessageType::Delta {
            return self.send_delta(msg.clock, msg.payload).await;
        }
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(msg.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Send a ping to the server.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(SyncMessage::ping(self.peer_info.peer_id)).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
