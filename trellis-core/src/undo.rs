//! Per-user scoped undo/redo.
//!
//! Each local user owns one [`ScopedUndoManager`]. Undo and redo never
//! replay a single-user edit log; instead they *reconcile* the live store
//! toward a captured [`HistorySnapshot`], touching only entities the user
//! created:
//!
//! ```text
//! for every node/edge id:
//!   target has id, live missing or created by user  → write target version
//!   target lacks id, live created by user           → delete
//!   live created by someone else                    → leave alone
//! ```
//!
//! Concurrent edits by other users therefore survive an undo. Ownership is
//! tracked per entity, not per field: if another user modified a field of an
//! entity this user created, undo restores the whole entity.

use crate::history::{HistorySnapshot, HistoryStack, OriginKind, DEFAULT_MAX_HISTORY};
use crate::model::UserId;
use crate::store::{Delta, MapName, RecordStore, StoreError, Transaction};

/// Result of an undo or redo request.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoOutcome {
    /// The store was reconciled toward `snapshot`. `delta` is `None` when the
    /// live state already matched for this user's entities.
    Applied {
        snapshot: HistorySnapshot,
        delta: Option<Delta>,
    },
    NothingToUndo,
    NothingToRedo,
    /// No store to reconcile against; the history position did not move.
    StoreUnavailable,
}

impl UndoOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UndoOutcome::Applied { .. })
    }

    /// Delta to broadcast, if any.
    pub fn delta(&self) -> Option<&Delta> {
        match self {
            UndoOutcome::Applied { delta, .. } => delta.as_ref(),
            _ => None,
        }
    }
}

/// History and reconciliation for one user.
#[derive(Debug, Clone)]
pub struct ScopedUndoManager {
    user_id: UserId,
    stack: HistoryStack,
}

impl ScopedUndoManager {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self::with_capacity(user_id, DEFAULT_MAX_HISTORY)
    }

    pub fn with_capacity(user_id: impl Into<UserId>, max_entries: usize) -> Self {
        Self {
            user_id: user_id.into(),
            stack: HistoryStack::new(max_entries),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Record a committed state.
    pub fn capture(&mut self, snapshot: HistorySnapshot) {
        self.stack.push(snapshot);
    }

    /// Capture the current state of `store`.
    pub fn capture_store(&mut self, store: &RecordStore, origin: OriginKind) {
        self.capture(HistorySnapshot::capture(store, origin));
    }

    /// Forget everything and start over from `baseline`.
    pub fn reset(&mut self, baseline: HistorySnapshot) {
        self.stack.clear();
        self.stack.push(HistorySnapshot {
            origin: OriginKind::Baseline,
            ..baseline
        });
    }

    pub fn can_undo(&self) -> bool {
        self.stack.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.stack.can_redo()
    }

    pub fn history(&self) -> &HistoryStack {
        &self.stack
    }

    pub fn undo(&mut self, store: Option<&mut RecordStore>) -> Result<UndoOutcome, StoreError> {
        let Some(target) = self.stack.previous().cloned() else {
            return Ok(UndoOutcome::NothingToUndo);
        };
        let Some(store) = store else {
            return Ok(UndoOutcome::StoreUnavailable);
        };
        let delta = self.reconcile(store, &target)?;
        self.stack.step_back();
        log::debug!(
            "Undo for {}: position {} of {}",
            self.user_id,
            self.stack.position(),
            self.stack.len()
        );
        Ok(UndoOutcome::Applied {
            snapshot: target,
            delta,
        })
    }

    pub fn redo(&mut self, store: Option<&mut RecordStore>) -> Result<UndoOutcome, StoreError> {
        let Some(target) = self.stack.next().cloned() else {
            return Ok(UndoOutcome::NothingToRedo);
        };
        let Some(store) = store else {
            return Ok(UndoOutcome::StoreUnavailable);
        };
        let delta = self.reconcile(store, &target)?;
        self.stack.step_forward();
        log::debug!(
            "Redo for {}: position {} of {}",
            self.user_id,
            self.stack.position(),
            self.stack.len()
        );
        Ok(UndoOutcome::Applied {
            snapshot: target,
            delta,
        })
    }

    /// Drive `store` toward `target` for this user's entities, in one batch.
    fn reconcile(
        &self,
        store: &mut RecordStore,
        target: &HistorySnapshot,
    ) -> Result<Option<Delta>, StoreError> {
        let user = self.user_id.as_str();
        store.transact(|tx| {
            reconcile_map(tx, MapName::Nodes, target, user)?;
            reconcile_map(tx, MapName::Edges, target, user)
        })
    }
}

fn reconcile_map(
    tx: &mut Transaction<'_>,
    map: MapName,
    target: &HistorySnapshot,
    user: &str,
) -> Result<(), StoreError> {
    for wanted in target.entities(map) {
        match tx.entity(map, &wanted.id) {
            Some(live) if live.created_by() != user => {}
            Some(live) if live == *wanted => {}
            _ => tx.put(map, wanted.clone())?,
        }
    }

    let stale: Vec<String> = tx
        .entities(map)
        .into_iter()
        .filter(|live| live.created_by() == user && target.get(map, &live.id).is_none())
        .map(|live| live.id)
        .collect();
    for id in stale {
        tx.remove(map, &id);
    }
    Ok(())
}
