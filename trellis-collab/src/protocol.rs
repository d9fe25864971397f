//! Binary protocol for diagram synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room_id  │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ string   │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `Delta` and `RoomState` payloads are opaque delta frames produced by
//! `trellis_core::RecordStore`; the transport never looks inside them.
//! Messages originating from the server itself carry the nil peer id.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use trellis_core::UserId;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First message on a connection; payload is `PeerInfo`
    Join = 1,
    /// Full document and presence state for a new member
    RoomState = 2,
    /// Incremental delta
    Delta = 3,
    /// Another connection joined the room; payload is `PeerInfo`
    PeerJoined = 4,
    /// A connection left the room; payload is `Departure`
    PeerLeft = 5,
    /// Heartbeat ping
    Ping = 6,
    /// Heartbeat pong
    Pong = 7,
}

/// Identity of one connection.
///
/// One user may hold several connections (tabs, devices), each with its own
/// `peer_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub user_id: UserId,
    pub name: String,
}

impl PeerInfo {
    pub fn new(user_id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), user_id, name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, user_id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            user_id: user_id.into(),
            name: name.into(),
        }
    }
}

/// Payload of `PeerLeft`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Departure {
    pub peer: PeerInfo,
    /// No other connection of the same user remains in the room.
    pub last_connection: bool,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room_id: String,
    /// Lamport clock of the sender
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room_id: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room_id: room_id.to_string(),
            clock,
            payload,
        }
    }

    /// Ask to join `room_id`.
    pub fn join(room_id: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Join, info.peer_id, room_id, 0, encode_payload(info)?))
    }

    /// Server reply to `Join`: a sync-state delta frame.
    pub fn room_state(room_id: &str, state: Vec<u8>) -> Self {
        Self::new(MessageType::RoomState, Uuid::nil(), room_id, 0, state)
    }

    /// Incremental delta.
    pub fn delta(peer_id: Uuid, room_id: &str, clock: u64, delta: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, room_id, clock, delta)
    }

    pub fn peer_joined(room_id: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, room_id, 0, encode_payload(info)?))
    }

    pub fn peer_left(room_id: &str, departure: &Departure) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::PeerLeft,
            departure.peer.peer_id,
            room_id,
            0,
            encode_payload(departure)?,
        ))
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the `PeerInfo` of a `Join` or `PeerJoined` message.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        match self.msg_type {
            MessageType::Join | MessageType::PeerJoined => decode_payload(&self.payload),
            _ => Err(ProtocolError::InvalidMessageType(self.msg_type)),
        }
    }

    /// Parse the payload of a `PeerLeft` message.
    pub fn departure(&self) -> Result<Departure, ProtocolError> {
        match self.msg_type {
            MessageType::PeerLeft => decode_payload(&self.payload),
            _ => Err(ProtocolError::InvalidMessageType(self.msg_type)),
        }
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
