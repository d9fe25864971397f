//! Client-side diagram session.
//!
//! A [`DiagramSession`] is one user's replica of a room. It performs no I/O:
//! feed it the [`SyncEvent`]s a [`SyncClient`](crate::client::SyncClient)
//! surfaces, and send the [`SyncMessage`]s its edit methods return.
//!
//! ```text
//! SyncClient ──SyncEvent──► handle_event ──► RecordStore ──► observers (UI)
//!     ▲                                          ▲
//!     └──────── SyncMessage ◄── upsert/remove/undo/redo/publish_presence
//! ```
//!
//! Every local edit that changes the store captures a history snapshot.
//! Remote deltas, undo and redo never do.
//!
//! A `RoomState` arriving after the first sync (reconnect, or resync after
//! lagging) is merged, and [`DiagramSession::handle_event`] answers it with
//! whatever the room is missing from this replica. Frames lost in flight are
//! recovered that way.

use std::collections::HashMap;
use uuid::Uuid;

use trellis_core::{
    now_millis, on_peer_left, own_entries_filter, publish_presence, CursorRecord, CursorThrottle,
    Delta, Entity, EntityId, Geometry, HistorySnapshot, MapName, ObserverId, OriginKind, Ownership,
    PresenceUpdate, Record, RecordStore, ScopedUndoManager, StoreError, Transaction, UndoOutcome,
};

use crate::client::SyncEvent;
use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Session errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// No room state has been received yet.
    #[error("Session has not received the room state yet")]
    NotSynced,
    #[error("Entity {0} is not a node")]
    NotANode(EntityId),
    #[error("Entity {0} is not an edge")]
    NotAnEdge(EntityId),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Session counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub deltas_applied: u64,
    pub decode_errors: u64,
    pub deltas_sent: u64,
}

/// One user's view of a room.
pub struct DiagramSession {
    peer: PeerInfo,
    room_id: String,
    store: Option<RecordStore>,
    undo: ScopedUndoManager,
    throttle: CursorThrottle,
    /// Lamport clock
    clock: u64,
    /// Known peers with their open connection count.
    peers: HashMap<Uuid, (PeerInfo, usize)>,
    connected: bool,
    stats: SessionStats,
}

impl DiagramSession {
    pub fn new(peer: PeerInfo, room_id: impl Into<String>) -> Self {
        let undo = ScopedUndoManager::new(peer.user_id.clone());
        Self {
            peer,
            room_id: room_id.into(),
            store: None,
            undo,
            throttle: CursorThrottle::new(),
            clock: 0,
            peers: HashMap::new(),
            connected: false,
            stats: SessionStats::default(),
        }
    }

    /// Replace the cursor throttle, e.g. to disable it in tests.
    pub fn with_throttle(mut self, throttle: CursorThrottle) -> Self {
        self.throttle = throttle;
        self
    }

    /// Replace the undo manager, e.g. to change the history depth.
    pub fn with_undo_capacity(mut self, max_entries: usize) -> Self {
        self.undo = ScopedUndoManager::with_capacity(self.peer.user_id.clone(), max_entries);
        self
    }

    /// The `Join` message announcing this session.
    pub fn join_message(&self) -> Result<SyncMessage, SessionError> {
        Ok(SyncMessage::join(&self.room_id, &self.peer)?)
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    /// Apply one event from the transport.
    ///
    /// Returns a message to send back when the room turned out to lack part
    /// of this replica's state. Malformed state or deltas are counted and
    /// dropped; they never fail the session.
    pub fn handle_event(&mut self, event: SyncEvent) -> Option<SyncMessage> {
        match event {
            SyncEvent::Connected => {
                self.connected = true;
            }
            SyncEvent::Disconnected => {
                self.connected = false;
                self.peers.clear();
            }
            SyncEvent::RoomState(state) => return self.on_room_state(&state),
            SyncEvent::RemoteDelta {
                peer_id,
                clock,
                payload,
            } => {
                self.clock = self.clock.max(clock);
                let Some(store) = self.store.as_mut() else {
                    log::debug!("Dropping delta from {peer_id}: no room state yet");
                    return None;
                };
                match store.apply_remote_delta(&payload) {
                    Ok(()) => self.stats.deltas_applied += 1,
                    Err(e) => {
                        self.stats.decode_errors += 1;
                        log::warn!("Dropping malformed delta from {peer_id}: {e}");
                    }
                }
            }
            SyncEvent::PeerJoined(info) => {
                log::debug!("{} joined {}", info.name, self.room_id);
                self.peers.entry(info.peer_id).or_insert((info, 0)).1 += 1;
            }
            SyncEvent::PeerLeft(departure) => {
                let peer_id = departure.peer.peer_id;
                let gone = match self.peers.get_mut(&peer_id) {
                    Some((_, connections)) => {
                        *connections = connections.saturating_sub(1);
                        *connections == 0 || departure.last_connection
                    }
                    None => false,
                };
                if gone {
                    self.peers.remove(&peer_id);
                }
                if departure.last_connection {
                    // The server broadcasts the same removal; this only
                    // makes it immediate.
                    if let Some(store) = self.store.as_mut() {
                        if let Err(e) = on_peer_left(store, &departure.peer.user_id) {
                            log::warn!("Cursor cleanup for {} failed: {e}", departure.peer.user_id);
                        }
                    }
                }
            }
            SyncEvent::Pong => {}
        }
        None
    }

    fn on_room_state(&mut self, state: &[u8]) -> Option<SyncMessage> {
        match self.store.as_mut() {
            // Reconnect or resync after lagging: merge, keep history, and
            // hand back what the room is missing.
            Some(store) => {
                if let Err(e) = store.apply_remote_delta(state) {
                    self.stats.decode_errors += 1;
                    log::warn!("Dropping malformed room state: {e}");
                    return None;
                }
                match store.encode_diff(state) {
                    Ok(Some(missing)) => {
                        log::info!(
                            "Room {} is missing {} bytes of local state; resending",
                            self.room_id,
                            missing.len()
                        );
                        Some(self.outgoing(missing))
                    }
                    Ok(None) => None,
                    Err(e) => {
                        log::warn!("Failed to diff against room state: {e}");
                        None
                    }
                }
            }
            None => {
                let mut store = RecordStore::new();
                if let Err(e) = store.apply_remote_delta(state) {
                    self.stats.decode_errors += 1;
                    log::warn!("Dropping malformed initial room state: {e}");
                    return None;
                }
                self.undo
                    .reset(HistorySnapshot::capture(&store, OriginKind::Baseline));
                log::info!(
                    "Session {} synced room {} ({} nodes, {} edges)",
                    self.peer.peer_id,
                    self.room_id,
                    store.len(MapName::Nodes),
                    store.len(MapName::Edges)
                );
                self.store = Some(store);
                None
            }
        }
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Run a batch of writes as one local edit.
    pub fn mutate<F>(&mut self, f: F) -> Result<Option<SyncMessage>, SessionError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), StoreError>,
    {
        let store = self.store.as_mut().ok_or(SessionError::NotSynced)?;
        let delta = store.transact(f)?;
        if delta.is_some() {
            self.undo.capture_store(store, OriginKind::Local);
        }
        Ok(delta.map(|d| self.outgoing(d)))
    }

    /// Insert or replace a node, stamping ownership.
    pub fn upsert_node(&mut self, node: Entity) -> Result<Option<SyncMessage>, SessionError> {
        if !node.is_node() {
            return Err(SessionError::NotANode(node.id));
        }
        self.upsert(MapName::Nodes, node)
    }

    /// Insert or replace an edge, stamping ownership.
    pub fn upsert_edge(&mut self, edge: Entity) -> Result<Option<SyncMessage>, SessionError> {
        if edge.is_node() {
            return Err(SessionError::NotAnEdge(edge.id));
        }
        self.upsert(MapName::Edges, edge)
    }

    fn upsert(&mut self, map: MapName, mut entity: Entity) -> Result<Option<SyncMessage>, SessionError> {
        let user = self.peer.user_id.clone();
        let existing = self
            .store
            .as_ref()
            .ok_or(SessionError::NotSynced)?
            .entity(map, &entity.id);
        match existing {
            Some(live) => {
                entity.ownership.created_by = live.ownership.created_by;
                entity.touch(&user, now_millis());
            }
            None => entity.ownership = Ownership::new(user),
        }
        self.mutate(|tx| tx.put(map, entity))
    }

    /// Remove a node together with the edges attached to it.
    pub fn remove_node(&mut self, id: &str) -> Result<Option<SyncMessage>, SessionError> {
        self.mutate(|tx| {
            let attached: Vec<EntityId> = tx
                .entities(MapName::Edges)
                .into_iter()
                .filter(|edge| match &edge.geometry {
                    Geometry::Edge { source, target, .. } => source == id || target == id,
                    Geometry::Node { .. } => false,
                })
                .map(|edge| edge.id)
                .collect();
            for edge in attached {
                tx.remove(MapName::Edges, &edge);
            }
            tx.remove(MapName::Nodes, id);
            Ok(())
        })
    }

    pub fn remove_edge(&mut self, id: &str) -> Result<Option<SyncMessage>, SessionError> {
        self.mutate(|tx| {
            tx.remove(MapName::Edges, id);
            Ok(())
        })
    }

    /// Undo this user's last edit. Other users' entities are untouched.
    pub fn undo(&mut self) -> Result<(UndoOutcome, Option<SyncMessage>), SessionError> {
        let outcome = self.undo.undo(self.store.as_mut())?;
        let msg = outcome.delta().cloned().map(|d| self.outgoing(d));
        Ok((outcome, msg))
    }

    pub fn redo(&mut self) -> Result<(UndoOutcome, Option<SyncMessage>), SessionError> {
        let outcome = self.undo.redo(self.store.as_mut())?;
        let msg = outcome.delta().cloned().map(|d| self.outgoing(d));
        Ok((outcome, msg))
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    // ─── Presence ─────────────────────────────────────────────────────

    /// Publish this user's cursor. Returns `None` while throttled.
    pub fn publish_presence(
        &mut self,
        update: PresenceUpdate,
    ) -> Result<Option<SyncMessage>, SessionError> {
        let store = self.store.as_mut().ok_or(SessionError::NotSynced)?;
        if !self.throttle.try_acquire() {
            return Ok(None);
        }
        let delta = publish_presence(store, &self.peer.user_id, update)?;
        Ok(delta.map(|d| self.outgoing(d)))
    }

    /// Cursors of everyone but this user.
    pub fn remote_cursors(&self) -> Vec<CursorRecord> {
        self.store
            .as_ref()
            .map(|s| own_entries_filter(&s.cursors(), &self.peer.user_id))
            .unwrap_or_default()
    }

    // ─── Observation ──────────────────────────────────────────────────

    pub fn observe<F>(&mut self, map: MapName, callback: F) -> Result<ObserverId, SessionError>
    where
        F: FnMut(&[Record]) + Send + 'static,
    {
        let store = self.store.as_mut().ok_or(SessionError::NotSynced)?;
        Ok(store.observe(map, callback))
    }

    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        self.store.as_mut().is_some_and(|s| s.unobserve(id))
    }

    fn outgoing(&mut self, delta: Delta) -> SyncMessage {
        self.clock += 1;
        self.stats.deltas_sent += 1;
        SyncMessage::delta(self.peer.peer_id, &self.room_id, self.clock, delta.into_bytes())
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn store(&self) -> Option<&RecordStore> {
        self.store.as_ref()
    }

    pub fn is_synced(&self) -> bool {
        self.store.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.values().map(|(info, _)| info.clone()).collect()
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn decode_errors(&self) -> u64 {
        self.stats.decode_errors
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.clone()
    }

    pub fn history(&self) -> &trellis_core::HistoryStack {
        self.undo.history()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use trellis_core::{Point, Size, Viewport};

    use crate::protocol::Departure;

    fn synced(user: &str) -> DiagramSession {
        let mut session = DiagramSession::new(PeerInfo::new(user, user), "r1")
            .with_throttle(CursorThrottle::with_interval(Duration::ZERO));
        let empty = RecordStore::new().encode_sync_state().unwrap();
        session.handle_event(SyncEvent::RoomState(empty.into_bytes()));
        session
    }

    fn deliver(to: &mut DiagramSession, msg: SyncMessage) {
        to.handle_event(SyncEvent::RemoteDelta {
            peer_id: msg.peer_id,
            clock: msg.clock,
            payload: msg.payload,
        });
    }

    fn node(id: &str) -> Entity {
        Entity::node(id, "rect", Point::new(0.0, 0.0), Size::new(10.0, 10.0), "nobody")
    }

    #[test]
    fn test_edits_need_room_state() {
        let mut session = DiagramSession::new(PeerInfo::new("a", "A"), "r1");
        assert!(!session.is_synced());
        assert_eq!(session.upsert_node(node("n1")), Err(SessionError::NotSynced));

        let (outcome, msg) = session.undo().unwrap();
        assert_eq!(outcome, UndoOutcome::NothingToUndo);
        assert!(msg.is_none());
    }

    #[test]
    fn test_upsert_stamps_ownership() {
        let mut a = synced("a");
        let mut b = synced("b");

        let msg = a.upsert_node(node("n1")).unwrap().unwrap();
        assert_eq!(msg.clock, 1);
        let created = a.store().unwrap().entity(MapName::Nodes, "n1").unwrap();
        assert_eq!(created.created_by(), "a");

        deliver(&mut b, msg);
        let mut moved = b.store().unwrap().entity(MapName::Nodes, "n1").unwrap();
        moved.move_to(Point::new(5.0, 5.0));
        b.upsert_node(moved).unwrap().unwrap();

        let live = b.store().unwrap().entity(MapName::Nodes, "n1").unwrap();
        assert_eq!(live.ownership.created_by, "a");
        assert_eq!(live.ownership.last_modified_by, "b");
        // Lamport: b saw clock 1, so its own edit is 2.
        assert_eq!(b.clock(), 2);
    }

    #[test]
    fn test_kind_checked() {
        let mut a = synced("a");
        let edge = Entity::edge("e1", "line", "n1", "n2", "a");
        assert_eq!(a.upsert_node(edge), Err(SessionError::NotANode("e1".into())));
        assert_eq!(a.upsert_edge(node("n1")), Err(SessionError::NotAnEdge("n1".into())));
    }

    #[test]
    fn test_undo_is_scoped_to_user() {
        let mut a = synced("a");
        let mut b = synced("b");

        let m = a.upsert_node(node("n1")).unwrap().unwrap();
        deliver(&mut b, m);
        let m = b.upsert_node(node("n2")).unwrap().unwrap();
        deliver(&mut a, m);

        let (outcome, msg) = a.undo().unwrap();
        assert!(outcome.is_applied());
        let store = a.store().unwrap();
        assert!(!store.contains(MapName::Nodes, "n1"));
        assert!(store.contains(MapName::Nodes, "n2"));

        deliver(&mut b, msg.unwrap());
        assert!(!b.store().unwrap().contains(MapName::Nodes, "n1"));
        assert!(b.store().unwrap().contains(MapName::Nodes, "n2"));

        let (outcome, _) = a.redo().unwrap();
        assert!(outcome.is_applied());
        let store = a.store().unwrap();
        assert!(store.contains(MapName::Nodes, "n1"));
        assert!(store.contains(MapName::Nodes, "n2"));
    }

    #[test]
    fn test_remote_edits_do_not_capture() {
        let mut a = synced("a");
        let mut b = synced("b");
        let m = b.upsert_node(node("n2")).unwrap().unwrap();
        deliver(&mut a, m);

        assert!(!a.can_undo());
        assert_eq!(a.history().len(), 1);
        assert_eq!(a.undo().unwrap().0, UndoOutcome::NothingToUndo);
    }

    #[test]
    fn test_remove_node_takes_edges() {
        let mut a = synced("a");
        a.upsert_node(node("n1")).unwrap();
        a.upsert_node(node("n2")).unwrap();
        a.upsert_edge(Entity::edge("e1", "line", "n1", "n2", "a")).unwrap();

        let msg = a.remove_node("n1").unwrap();
        assert!(msg.is_some());
        let store = a.store().unwrap();
        assert!(!store.contains(MapName::Nodes, "n1"));
        assert!(!store.contains(MapName::Edges, "e1"));
        assert!(store.contains(MapName::Nodes, "n2"));

        // Removing something absent is not an edit.
        assert!(a.remove_edge("e1").unwrap().is_none());
    }

    #[test]
    fn test_malformed_delta_counted() {
        let mut a = synced("a");
        a.handle_event(SyncEvent::RemoteDelta {
            peer_id: Uuid::new_v4(),
            clock: 3,
            payload: vec![0xFF, 0x00, 0x13],
        });
        assert_eq!(a.decode_errors(), 1);
        assert!(a.is_synced());
    }

    #[test]
    fn test_malformed_initial_state_leaves_session_unsynced() {
        let mut a = DiagramSession::new(PeerInfo::new("a", "A"), "r1");
        a.handle_event(SyncEvent::RoomState(vec![1, 2, 3]));
        assert!(!a.is_synced());
        assert_eq!(a.decode_errors(), 1);
    }

    #[test]
    fn test_presence_and_peer_left() {
        let mut a = synced("a");
        let mut b = synced("b");
        let update = PresenceUpdate {
            position: Point::new(1.0, 2.0),
            viewport: Viewport::default(),
            name: "Ada".into(),
        };
        let m = a.publish_presence(update.clone()).unwrap().unwrap();
        deliver(&mut b, m);
        b.publish_presence(PresenceUpdate {
            name: "Bob".into(),
            ..update
        })
        .unwrap();

        let seen = b.remote_cursors();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].owner_id, "a");
        assert!(a.remote_cursors().is_empty());

        let a_info = a.peer_info().clone();
        b.handle_event(SyncEvent::PeerJoined(a_info.clone()));
        assert_eq!(b.peers().len(), 1);
        b.handle_event(SyncEvent::PeerLeft(Departure {
            peer: a_info,
            last_connection: true,
        }));
        assert!(b.remote_cursors().is_empty());
        assert!(b.peers().is_empty());
    }

    #[test]
    fn test_presence_throttled() {
        let mut a = DiagramSession::new(PeerInfo::new("a", "A"), "r1");
        let empty = RecordStore::new().encode_sync_state().unwrap();
        a.handle_event(SyncEvent::RoomState(empty.into_bytes()));
        let update = PresenceUpdate {
            position: Point::new(1.0, 2.0),
            viewport: Viewport::default(),
            name: "Ada".into(),
        };
        assert!(a.publish_presence(update.clone()).unwrap().is_some());
        assert!(a.publish_presence(update).unwrap().is_none());
    }

    #[test]
    fn test_observer_sees_remote_batch() {
        let mut a = synced("a");
        let mut b = synced("b");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        b.observe(MapName::Nodes, move |records| {
            sink.lock().unwrap().push(records.len());
        })
        .unwrap();

        let m = a
            .mutate(|tx| {
                tx.put_node(node("n1"))?;
                tx.put_node(node("n2"))
            })
            .unwrap()
            .unwrap();
        deliver(&mut b, m);

        // One notification with both nodes, never a half-applied batch.
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_resync_answers_with_lost_edits() {
        let mut a = synced("a");
        let mut room = RecordStore::new();

        // First edit lost in flight; the second depends on it.
        let _lost = a.upsert_node(node("n1")).unwrap().unwrap();
        let kept = a.upsert_node(node("n2")).unwrap().unwrap();
        room.apply_remote_delta(&kept.payload).unwrap();
        assert!(room.nodes().is_empty());

        let state = room.encode_sync_state().unwrap().into_bytes();
        let reply = a.handle_event(SyncEvent::RoomState(state)).unwrap();
        assert_eq!(reply.clock, 3);
        room.apply_remote_delta(&reply.payload).unwrap();
        assert_eq!(room.nodes(), a.store().unwrap().nodes());

        // Already in sync: nothing to send.
        let state = room.encode_sync_state().unwrap().into_bytes();
        assert!(a.handle_event(SyncEvent::RoomState(state)).is_none());
    }

    #[test]
    fn test_peer_with_two_connections_stays_known() {
        let mut a = synced("a");
        let b = PeerInfo::new("b", "B");
        a.handle_event(SyncEvent::PeerJoined(b.clone()));
        a.handle_event(SyncEvent::PeerJoined(b.clone()));
        a.handle_event(SyncEvent::PeerLeft(Departure {
            peer: b.clone(),
            last_connection: false,
        }));
        assert_eq!(a.peers(), vec![b.clone()]);

        a.handle_event(SyncEvent::PeerLeft(Departure {
            peer: b,
            last_connection: true,
        }));
        assert!(a.peers().is_empty());
    }

    #[test]
    fn test_resync_merges_without_resetting_history() {
        let mut a = synced("a");
        a.upsert_node(node("n1")).unwrap();
        assert!(a.can_undo());

        let mut other = RecordStore::new();
        other
            .transact(|tx| tx.put_node(node("n9")))
            .unwrap();
        a.handle_event(SyncEvent::RoomState(other.encode_sync_state().unwrap().into_bytes()));

        let store = a.store().unwrap();
        assert!(store.contains(MapName::Nodes, "n1"));
        assert!(store.contains(MapName::Nodes, "n9"));
        assert!(a.can_undo());
    }
}
