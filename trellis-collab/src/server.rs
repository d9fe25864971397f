//! WebSocket sync server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── Join(room_id) ── RoomManager ── Room ── RecordStore (merge)
//! Client B ──┘                                   │
//!                                                ├── BroadcastGroup (fan-out)
//!                                                └── SnapshotStore
//!                                                      ├── MemoryStore
//!                                                      └── DocumentStore (RocksDB)
//! ```
//!
//! A connection is unbound until its first `Join`. After that every `Delta`
//! it sends is merged into the room and relayed under the connection's own
//! peer id, whatever id the frame claims.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::Inbound;
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::room::{RoomError, RoomManager, RoomMember, DEFAULT_PERSIST_INTERVAL};
use crate::storage::{DocumentStore, MemoryStore, SnapshotStore, StorageError, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Interval between persistence ticks
    pub persist_interval: Duration,
    /// RocksDB path (None = in-memory snapshots only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            persist_interval: DEFAULT_PERSIST_INTERVAL,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory storage, fast ticks.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            persist_interval: Duration::from_millis(50),
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    pub active_rooms: usize,
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Room error: {0}")]
    Room(#[from] RoomError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let storage: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(DocumentStore::open(store_config)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_storage(config, storage))
    }

    /// Create a server over an existing snapshot store.
    pub fn with_storage(config: ServerConfig, storage: Arc<dyn SnapshotStore>) -> Self {
        let rooms = Arc::new(RoomManager::new(storage, config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Bind and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` and start the persistence tick.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        let persistence = self.rooms.spawn_persistence(self.config.persist_interval);

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => break Err(e.into()),
            };
            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::warn!("Connection {addr} ended with error: {e}");
                }
            });
        };

        persistence.abort();
        result
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut member: Option<RoomMember> = None;
        let result = Self::drive(ws_stream, &rooms, &stats, &mut member).await;

        if let Some(member) = member {
            let room_id = member.room().id().to_string();
            match member.leave() {
                Ok(true) => {
                    rooms.close_if_empty(&room_id).await;
                }
                Ok(false) => {}
                Err(e) => log::warn!("Leaving room {room_id} failed: {e}"),
            }
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection {addr} closed");
        result
    }

    /// Pump one connection until it closes.
    async fn drive(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        rooms: &RoomManager,
        stats: &RwLock<ServerStats>,
        member: &mut Option<RoomMember>,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }

                            let sync_msg = match SyncMessage::decode(&data) {
                                Ok(m) => m,
                                Err(e) => {
                                    stats.write().await.malformed_messages += 1;
                                    log::warn!("Dropping undecodable frame: {e}");
                                    continue;
                                }
                            };

                            match sync_msg.msg_type {
                                MessageType::Join => {
                                    if member.is_some() {
                                        log::warn!("Ignoring second Join from {}", sync_msg.peer_id);
                                        continue;
                                    }
                                    let info = match sync_msg.peer_info() {
                                        Ok(info) => info,
                                        Err(e) => {
                                            stats.write().await.malformed_messages += 1;
                                            log::warn!("Dropping Join with bad payload: {e}");
                                            continue;
                                        }
                                    };
                                    let (joined, state) = rooms.join(&sync_msg.room_id, info).await?;
                                    *member = Some(joined);
                                    stats.write().await.active_rooms = rooms.room_count().await;
                                    ws_sender.send(Message::Binary(state.encode()?.into())).await?;
                                }
                                MessageType::Delta => match member.as_ref() {
                                    // Already counted by the room; the connection stays up.
                                    Some(m) => {
                                        if let Err(e) = m.submit_delta(sync_msg.clock, &sync_msg.payload) {
                                            log::debug!("Delta from {} rejected: {e}", m.info().peer_id);
                                        }
                                    }
                                    None => log::warn!("Delta before Join from {}", sync_msg.peer_id),
                                },
                                MessageType::Ping => {
                                    let peer_id = member.as_ref().map_or(Uuid::nil(), |m| m.info().peer_id);
                                    let pong = SyncMessage::pong(peer_id);
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                }
                                other => {
                                    log::debug!("Ignoring client-sent {other:?}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }
                inbound = async {
                    match member.as_mut() {
                        Some(m) => m.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match inbound {
                        Some(Inbound::Message(bytes)) => {
                            ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                        }
                        Some(Inbound::Lagged(missed)) => {
                            if let Some(m) = member.as_ref() {
                                log::warn!(
                                    "Resyncing {} after {missed} missed messages",
                                    m.info().peer_id
                                );
                                let state = m.room().sync_state()?;
                                ws_sender.send(Message::Binary(state.encode()?.into())).await?;
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Save every dirty room now.
    pub async fn persist_now(&self) {
        self.rooms.persist_all().await;
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}
