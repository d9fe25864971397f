//! Trellis core: the sans-IO engine behind collaborative diagrams.
//!
//! ```text
//! local edit ──► RecordStore::transact ──► Delta ──► (transport) ──► peers
//!                     │                                   │
//!                     ▼                                   ▼
//!                observers                    RecordStore::apply_remote_delta
//!                     │
//!                     ▼
//!            ScopedUndoManager::capture
//! ```
//!
//! - [`store`]: node, edge and cursor maps on top of `yrs`, local and remote merges
//! - [`history`]: bounded snapshot history
//! - [`undo`]: per-user scoped undo/redo by reconciliation
//! - [`presence`]: cursor publishing, cleanup and throttling
//!
//! Nothing in this crate performs I/O; networking and persistence live in
//! `trellis-collab`.

pub mod history;
pub mod model;
pub mod presence;
pub mod store;
pub mod undo;

pub use history::{HistorySnapshot, HistoryStack, OriginKind, DEFAULT_MAX_HISTORY};
pub use model::{
    now_millis, CursorRecord, Entity, EntityId, Geometry, Ownership, Payload, PayloadValue,
    Point, Size, UserId, Viewport,
};
pub use presence::{
    on_peer_left, own_entries_filter, publish_presence, CursorColor, CursorThrottle,
    PresenceUpdate,
};
pub use store::{
    Delta, MapName, Mutation, ObserverId, Record, RecordStore, StoreError, Transaction,
};
pub use undo::{ScopedUndoManager, UndoOutcome};
