//! Shared helpers for the end-to-end tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use trellis_collab::{
    DiagramSession, PeerInfo, ServerConfig, SnapshotStore, SyncClient, SyncEvent, SyncMessage,
    SyncServer,
};
use trellis_core::{CursorThrottle, Entity, Point, Size};

pub const ROOM: &str = "r1";

/// Start a server over `storage` on an ephemeral port.
pub async fn start_server(storage: Arc<dyn SnapshotStore>) -> (String, Arc<SyncServer>) {
    let server = Arc::new(SyncServer::with_storage(ServerConfig::for_testing(), storage));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (format!("ws://{addr}"), server)
}

/// A connected client plus the session consuming its events.
pub struct Peer {
    pub client: SyncClient,
    pub events: mpsc::Receiver<SyncEvent>,
    pub session: DiagramSession,
}

impl Peer {
    /// Connect `user` to [`ROOM`] and wait for the room state.
    pub async fn join(url: &str, user: &str) -> Peer {
        let info = PeerInfo::new(user, user);
        let mut client = SyncClient::new(info.clone(), ROOM, url);
        let events = client.take_event_rx().unwrap();
        let session = DiagramSession::new(info, ROOM)
            .with_throttle(CursorThrottle::with_interval(Duration::ZERO));
        client.connect().await.unwrap();

        let mut peer = Peer {
            client,
            events,
            session,
        };
        peer.pump_until(|s| s.is_synced()).await;
        peer
    }

    pub async fn send(&self, msg: Option<SyncMessage>) {
        if let Some(msg) = msg {
            self.client.send(msg).await.unwrap();
        }
    }

    /// Feed events into the session until `done` holds, sending back any
    /// reply the session produces.
    pub async fn pump_until<F>(&mut self, mut done: F)
    where
        F: FnMut(&DiagramSession) -> bool,
    {
        let session = &mut self.session;
        let events = &mut self.events;
        let client = &self.client;
        timeout(Duration::from_secs(5), async {
            while !done(session) {
                let event = events.recv().await.expect("event channel closed");
                if let Some(reply) = session.handle_event(event) {
                    client.send(reply).await.unwrap();
                }
            }
        })
        .await
        .expect("timed out waiting for session state");
    }
}

pub fn node(id: &str) -> Entity {
    Entity::node(id, "rect", Point::new(0.0, 0.0), Size::new(100.0, 50.0), "unset")
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}
