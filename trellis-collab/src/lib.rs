//! # trellis-collab: Real-time transport for Trellis diagrams
//!
//! Binds the [`trellis_core::RecordStore`] merge engine to WebSocket rooms.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient     │ ◄────────────────► │ SyncServer   │
//! │ DiagramSession │   Binary Proto     │ RoomManager  │
//! └───────┬────────┘                    └──────┬───────┘
//!         │                                    │
//!         ▼                                    ▼
//! ┌────────────────┐                   ┌──────────────┐
//! │ RecordStore    │                   │ Room         │
//! │ (replica)      │                   │ RecordStore  │──► SnapshotStore
//! └────────────────┘                   │ Broadcast    │
//!                                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`]: Per-room fan-out with lag detection
//! - [`room`]: Rooms, membership and the persistence policy
//! - [`storage`]: Snapshot stores (in-memory, RocksDB)
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client with offline queue
//! - [`session`]: Sans-IO per-user replica with scoped undo

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope, Inbound, Subscriber};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use protocol::{Departure, MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use room::{
    PersistOutcome, Room, RoomError, RoomManager, RoomMember, RoomStats, DEFAULT_PERSIST_INTERVAL,
};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{DiagramSession, SessionError, SessionStats};
pub use storage::{
    DocumentStore, MemoryStore, SnapshotMetadata, SnapshotStore, StorageError, StoreConfig,
};
