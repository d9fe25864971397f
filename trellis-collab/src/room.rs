//! Rooms: one shared diagram session per room id.
//!
//! Architecture:
//! ```text
//!                 ┌──────────────────────────── Room "r1" ──────────────────┐
//! Client A ──┐    │  Mutex<RecordStore>   ◄── apply_remote_delta            │
//!            ├──► │  BroadcastGroup       ──► relay to N-1 members          │
//! Client B ──┘    │  members (connection → peer)                           │
//!                 │  dirty / loaded flags ──► SnapshotStore (every tick)    │
//!                 └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Persistence policy:
//! - the snapshot is loaded once when the room opens; a failed or corrupt
//!   load leaves the room empty but usable, suppresses saves (so the stored
//!   snapshot is never clobbered) and is retried on every tick
//! - a dirty room is saved on every tick and when its last member leaves
//! - a failed save restores the dirty flag; the next tick retries
//! - broadcast never waits on storage
//!
//! The store mutex is only held for synchronous merge/encode work, never
//! across an `.await` or a storage call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use trellis_core::{now_millis, on_peer_left, Delta, RecordStore, StoreError};

use crate::broadcast::{BroadcastGroup, BroadcastStats, Inbound, Subscriber};
use crate::protocol::{Departure, PeerInfo, ProtocolError, SyncMessage};
use crate::storage::SnapshotStore;

/// Default interval between persistence ticks.
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(5);

/// Room errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoomError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Point-in-time room counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub members: usize,
    pub deltas_applied: u64,
    pub decode_errors: u64,
    pub snapshots_saved: u64,
    pub save_failures: u64,
    pub load_failures: u64,
    pub lagged_messages: u64,
}

#[derive(Default)]
struct AtomicRoomStats {
    deltas_applied: AtomicU64,
    decode_errors: AtomicU64,
    snapshots_saved: AtomicU64,
    save_failures: AtomicU64,
    load_failures: AtomicU64,
}

/// What a persistence attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Nothing changed since the last save.
    Clean,
    Saved,
    /// The save failed; the room stays dirty.
    Failed,
    /// The initial snapshot has not been loaded yet; saving is suppressed.
    NotLoaded,
}

/// One diagram session.
pub struct Room {
    id: String,
    store: Mutex<RecordStore>,
    broadcast: BroadcastGroup,
    storage: Arc<dyn SnapshotStore>,
    /// Keyed by connection id; one peer may hold several connections.
    members: Mutex<HashMap<Uuid, PeerInfo>>,
    dirty: AtomicBool,
    loaded: AtomicBool,
    stats: AtomicRoomStats,
}

impl Room {
    /// Open a room, loading its snapshot from `storage`.
    pub fn open(
        id: impl Into<String>,
        storage: Arc<dyn SnapshotStore>,
        broadcast_capacity: usize,
    ) -> Arc<Self> {
        let room = Arc::new(Self {
            id: id.into(),
            store: Mutex::new(RecordStore::new()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            storage,
            members: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            stats: AtomicRoomStats::default(),
        });
        room.try_load();
        log::info!(
            "Room {} opened ({} nodes, {} edges)",
            room.id,
            room.with_store(|s| s.nodes().len()),
            room.with_store(|s| s.edges().len())
        );
        room
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run `f` with exclusive access to the room's store.
    pub fn with_store<T>(&self, f: impl FnOnce(&mut RecordStore) -> T) -> T {
        let mut store = lock(&self.store);
        f(&mut store)
    }

    fn members(&self) -> MutexGuard<'_, HashMap<Uuid, PeerInfo>> {
        lock(&self.members)
    }

    pub fn member_count(&self) -> usize {
        self.members().len()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.members().values().cloned().collect()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RoomStats {
        let BroadcastStats {
            messages_lagged, ..
        } = self.broadcast.stats();
        RoomStats {
            members: self.member_count(),
            deltas_applied: self.stats.deltas_applied.load(Ordering::Relaxed),
            decode_errors: self.stats.decode_errors.load(Ordering::Relaxed),
            snapshots_saved: self.stats.snapshots_saved.load(Ordering::Relaxed),
            save_failures: self.stats.save_failures.load(Ordering::Relaxed),
            load_failures: self.stats.load_failures.load(Ordering::Relaxed),
            lagged_messages: messages_lagged,
        }
    }

    // ─── Membership ───────────────────────────────────────────────────

    /// Add a connection to the room.
    ///
    /// Every call gets its own connection id, so a peer reconnecting with the
    /// same [`PeerInfo`] before its old socket is reaped holds two distinct
    /// memberships. Returns the member handle and the `RoomState` message to
    /// send it. The subscription is taken before the state is encoded, so
    /// the new member may see a delta twice but never misses one.
    pub fn join(self: &Arc<Self>, info: PeerInfo) -> Result<(RoomMember, SyncMessage), RoomError> {
        let connection_id = Uuid::new_v4();
        let subscriber = self.broadcast.subscribe(connection_id);
        let state = self.with_store(|s| s.encode_sync_state())?;
        self.members().insert(connection_id, info.clone());

        self.broadcast
            .broadcast(connection_id, &SyncMessage::peer_joined(&self.id, &info)?)?;
        log::info!(
            "Peer {} ({}) joined room {} as connection {connection_id} ({} members)",
            info.peer_id,
            info.user_id,
            self.id,
            self.member_count()
        );

        let member = RoomMember {
            room: self.clone(),
            connection_id,
            info,
            subscriber,
        };
        Ok((member, SyncMessage::room_state(&self.id, state.into_bytes())))
    }

    fn leave(&self, connection_id: Uuid, info: &PeerInfo) -> Result<bool, RoomError> {
        let (last_connection, empty) = {
            let mut members = self.members();
            members.remove(&connection_id);
            let last = !members.values().any(|p| p.user_id == info.user_id);
            (last, members.is_empty())
        };

        if last_connection {
            let cleanup = self.with_store(|s| on_peer_left(s, &info.user_id))?;
            if let Some(delta) = cleanup {
                self.broadcast_delta(Uuid::nil(), 0, delta)?;
            }
        }

        let departure = Departure {
            peer: info.clone(),
            last_connection,
        };
        self.broadcast
            .broadcast(connection_id, &SyncMessage::peer_left(&self.id, &departure)?)?;
        log::info!("Peer {} left room {} (connection {connection_id})", info.peer_id, self.id);
        Ok(empty)
    }

    // ─── Deltas ───────────────────────────────────────────────────────

    /// Merge a delta from `origin` and relay it to everyone else.
    ///
    /// A malformed delta is counted and dropped; nothing is relayed.
    pub fn apply_delta(&self, origin: Uuid, clock: u64, payload: &[u8]) -> Result<(), RoomError> {
        self.relay(origin, origin, clock, payload)
    }

    /// Merge, then relay as `peer_id` to every connection but `connection_id`.
    fn relay(
        &self,
        connection_id: Uuid,
        peer_id: Uuid,
        clock: u64,
        payload: &[u8],
    ) -> Result<(), RoomError> {
        if let Err(e) = self.with_store(|s| s.apply_remote_delta(payload)) {
            self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            log::warn!("Dropping malformed delta from {peer_id} in room {}: {e}", self.id);
            return Err(e.into());
        }
        self.stats.deltas_applied.fetch_add(1, Ordering::Relaxed);
        if Delta::touches_document(payload) {
            self.dirty.store(true, Ordering::SeqCst);
        }

        let relay = SyncMessage::delta(peer_id, &self.id, clock, payload.to_vec());
        let receivers = self.broadcast.broadcast(connection_id, &relay)?;
        log::trace!("Relayed {} byte delta from {peer_id} to {receivers} receivers", payload.len());
        Ok(())
    }

    /// Broadcast a delta produced on the server replica itself.
    fn broadcast_delta(&self, origin: Uuid, clock: u64, delta: Delta) -> Result<(), RoomError> {
        if Delta::touches_document(delta.as_bytes()) {
            self.dirty.store(true, Ordering::SeqCst);
        }
        let msg = SyncMessage::delta(origin, &self.id, clock, delta.into_bytes());
        self.broadcast.broadcast(origin, &msg)?;
        Ok(())
    }

    /// Current full state, for members that fell behind.
    pub fn sync_state(&self) -> Result<SyncMessage, RoomError> {
        let state = self.with_store(|s| s.encode_sync_state())?;
        Ok(SyncMessage::room_state(&self.id, state.into_bytes()))
    }

    // ─── Persistence ──────────────────────────────────────────────────

    /// Attempt to load the stored snapshot. Returns whether the room is loaded.
    ///
    /// A snapshot arriving after members already edited is merged into the
    /// live state and the merged state is broadcast to everyone.
    pub fn try_load(&self) -> bool {
        if self.is_loaded() {
            return true;
        }
        let snapshot = match self.storage.load_snapshot(&self.id) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.stats.load_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to load snapshot for room {}: {e}", self.id);
                return false;
            }
        };

        if let Some(bytes) = snapshot {
            if let Err(e) = self.with_store(|s| s.decode_and_load_full_state(&bytes)) {
                self.stats.load_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Stored snapshot for room {} is unreadable: {e}", self.id);
                return false;
            }
            if self.member_count() > 0 {
                match self.with_store(|s| s.encode_sync_state()) {
                    Ok(state) => {
                        if let Err(e) = self.broadcast_delta(Uuid::nil(), 0, state) {
                            log::warn!("Failed to broadcast late snapshot for room {}: {e}", self.id);
                        }
                    }
                    Err(e) => log::warn!("Failed to encode room {} state: {e}", self.id),
                }
            }
            log::info!("Loaded snapshot for room {} ({} bytes)", self.id, bytes.len());
        }
        self.loaded.store(true, Ordering::SeqCst);
        true
    }

    /// Save the room if it changed since the last successful save.
    pub fn persist(&self) -> PersistOutcome {
        if !self.try_load() {
            return PersistOutcome::NotLoaded;
        }
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return PersistOutcome::Clean;
        }

        let snapshot = self.with_store(|s| s.encode_full_state());
        match self.storage.save_snapshot(&self.id, &snapshot, now_millis()) {
            Ok(()) => {
                self.stats.snapshots_saved.fetch_add(1, Ordering::Relaxed);
                log::info!("Saved snapshot for room {} ({} bytes)", self.id, snapshot.len());
                PersistOutcome::Saved
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                self.stats.save_failures.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to save snapshot for room {}: {e}", self.id);
                PersistOutcome::Failed
            }
        }
    }

    /// Nothing left to lose by dropping the room from memory.
    fn can_close(&self, outcome: PersistOutcome) -> bool {
        match outcome {
            PersistOutcome::Clean | PersistOutcome::Saved => true,
            PersistOutcome::NotLoaded => !self.is_dirty(),
            PersistOutcome::Failed => false,
        }
    }
}

/// Handle for one connection in a room. Dropping it without [`leave`]
/// leaves a stale member entry behind.
///
/// [`leave`]: RoomMember::leave
pub struct RoomMember {
    room: Arc<Room>,
    connection_id: Uuid,
    info: PeerInfo,
    subscriber: Subscriber,
}

impl RoomMember {
    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// Server-assigned id of this connection.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Next message relayed by other members.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.subscriber.recv().await
    }

    /// Merge and relay a delta sent by this member.
    pub fn submit_delta(&self, clock: u64, payload: &[u8]) -> Result<(), RoomError> {
        self.room
            .relay(self.connection_id, self.info.peer_id, clock, payload)
    }

    /// Leave the room. Returns `true` if it is now empty.
    ///
    /// When this was the user's last connection, the user's cursor is removed
    /// and the removal broadcast.
    pub fn leave(self) -> Result<bool, RoomError> {
        self.room.leave(self.connection_id, &self.info)
    }
}

/// Maps room ids to open rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    storage: Arc<dyn SnapshotStore>,
    broadcast_capacity: usize,
}

impl RoomManager {
    pub fn new(storage: Arc<dyn SnapshotStore>, broadcast_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            storage,
            broadcast_capacity,
        }
    }

    /// Get an open room or open it from storage.
    pub async fn get_or_open(&self, room_id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }
        let room = Room::open(room_id, self.storage.clone(), self.broadcast_capacity);
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    /// Join `room_id`, opening it if needed.
    ///
    /// The member is registered while the room map is locked, so a
    /// concurrent [`close_if_empty`] or [`persist_all`] can never drop the
    /// room between opening and joining.
    ///
    /// [`close_if_empty`]: RoomManager::close_if_empty
    /// [`persist_all`]: RoomManager::persist_all
    pub async fn join(
        &self,
        room_id: &str,
        info: PeerInfo,
    ) -> Result<(RoomMember, SyncMessage), RoomError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.join(info);
            }
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::open(room_id, self.storage.clone(), self.broadcast_capacity))
            .clone();
        room.join(info)
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Save and drop a room that has no members left.
    ///
    /// A room whose final save fails stays registered so a later tick can
    /// retry. Returns whether the room was removed.
    pub async fn close_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(room_id).cloned() else {
            return false;
        };
        if room.member_count() > 0 {
            return false;
        }
        let outcome = room.persist();
        if room.can_close(outcome) {
            rooms.remove(room_id);
            log::info!("Room {room_id} closed");
            true
        } else {
            log::warn!("Room {room_id} kept open: final save {outcome:?}");
            false
        }
    }

    /// Persist every dirty room and drop empty rooms that are safely saved.
    pub async fn persist_all(&self) -> Vec<(String, PersistOutcome)> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut outcomes = Vec::with_capacity(rooms.len());
        let mut closable = Vec::new();

        for room in rooms {
            let outcome = room.persist();
            if room.member_count() == 0 && room.can_close(outcome) {
                closable.push(room.id().to_string());
            }
            outcomes.push((room.id().to_string(), outcome));
        }

        if !closable.is_empty() {
            let mut rooms = self.rooms.write().await;
            for id in closable {
                // A member may have joined since the check above.
                if rooms.get(&id).is_some_and(|r| r.member_count() == 0 && !r.is_dirty()) {
                    rooms.remove(&id);
                    log::info!("Room {id} closed after deferred save");
                }
            }
        }
        outcomes
    }

    /// Run [`persist_all`] every `interval` until the manager is dropped.
    ///
    /// [`persist_all`]: RoomManager::persist_all
    pub fn spawn_persistence(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let outcomes = manager.persist_all().await;
                let failed = outcomes
                    .iter()
                    .filter(|(_, o)| *o == PersistOutcome::Failed)
                    .count();
                if failed > 0 {
                    log::warn!("Persistence tick: {failed} of {} rooms failed to save", outcomes.len());
                }
            }
        })
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
