//! Presence over the wire: cursors propagate, exclude self, vanish on leave,
//! and never reach a snapshot.

mod common;

use std::sync::Arc;

use common::{eventually, start_server, Peer, ROOM};
use trellis_collab::{MemoryStore, SnapshotStore, SyncEvent};
use trellis_core::{Point, PresenceUpdate, RecordStore, Viewport};

fn cursor_at(x: f64, y: f64, name: &str) -> PresenceUpdate {
    PresenceUpdate {
        position: Point::new(x, y),
        viewport: Viewport::default(),
        name: name.to_string(),
    }
}

#[tokio::test]
async fn test_cursor_reaches_other_peer_only() {
    let (url, _server) = start_server(Arc::new(MemoryStore::new())).await;
    let mut alice = Peer::join(&url, "alice").await;
    let mut bob = Peer::join(&url, "bob").await;

    let msg = alice.session.publish_presence(cursor_at(10.0, 20.0, "Alice")).unwrap();
    alice.send(msg).await;
    let msg = bob.session.publish_presence(cursor_at(1.0, 1.0, "Bob")).unwrap();
    bob.send(msg).await;

    bob.pump_until(|s| !s.remote_cursors().is_empty()).await;
    alice.pump_until(|s| !s.remote_cursors().is_empty()).await;

    let seen_by_bob = bob.session.remote_cursors();
    assert_eq!(seen_by_bob.len(), 1);
    assert_eq!(seen_by_bob[0].owner_id, "alice");
    assert_eq!(seen_by_bob[0].position, Point::new(10.0, 20.0));
    assert_eq!(seen_by_bob[0].name, "Alice");

    let seen_by_alice = alice.session.remote_cursors();
    assert_eq!(seen_by_alice.len(), 1);
    assert_eq!(seen_by_alice[0].owner_id, "bob");
}

#[tokio::test]
async fn test_cursor_removed_when_user_leaves() {
    let (url, _server) = start_server(Arc::new(MemoryStore::new())).await;
    let mut alice = Peer::join(&url, "alice").await;
    let mut bob = Peer::join(&url, "bob").await;

    let msg = alice.session.publish_presence(cursor_at(5.0, 5.0, "Alice")).unwrap();
    alice.send(msg).await;
    bob.pump_until(|s| s.remote_cursors().len() == 1).await;

    alice.client.disconnect().await;
    bob.pump_until(|s| s.remote_cursors().is_empty() && s.peers().is_empty()).await;
}

#[tokio::test]
async fn test_second_tab_keeps_cursor_alive() {
    let (url, _server) = start_server(Arc::new(MemoryStore::new())).await;
    let mut alice_tab1 = Peer::join(&url, "alice").await;
    let _alice_tab2 = Peer::join(&url, "alice").await;
    let mut bob = Peer::join(&url, "bob").await;

    let msg = alice_tab1.session.publish_presence(cursor_at(5.0, 5.0, "Alice")).unwrap();
    alice_tab1.send(msg).await;
    bob.pump_until(|s| s.remote_cursors().len() == 1).await;

    alice_tab1.client.disconnect().await;
    let departure = loop {
        match bob.events.recv().await.unwrap() {
            SyncEvent::PeerLeft(departure) => break departure,
            other => {
                bob.session.handle_event(other);
            }
        }
    };
    assert!(!departure.last_connection);
    bob.session.handle_event(SyncEvent::PeerLeft(departure));
    assert_eq!(bob.session.remote_cursors().len(), 1);
}

#[tokio::test]
async fn test_cursors_never_persisted() {
    let storage = Arc::new(MemoryStore::new());
    let (url, _server) = start_server(storage.clone()).await;
    let mut alice = Peer::join(&url, "alice").await;

    let msg = alice.session.publish_presence(cursor_at(5.0, 5.0, "Alice")).unwrap();
    alice.send(msg).await;
    let msg = alice.session.upsert_node(common::node("n1")).unwrap();
    alice.send(msg).await;

    eventually(|| {
        let storage = storage.clone();
        async move { storage.save_count() > 0 }
    })
    .await;

    let snapshot = storage.load_snapshot(ROOM).unwrap().unwrap();
    let restored = RecordStore::from_snapshot(&snapshot).unwrap();
    assert_eq!(restored.nodes().len(), 1);
    assert!(restored.cursors().is_empty());
}
