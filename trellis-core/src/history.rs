//! Bounded history of committed diagram states.

use std::collections::VecDeque;

use crate::model::Entity;
use crate::store::{MapName, RecordStore};

/// Default number of snapshots kept per user.
pub const DEFAULT_MAX_HISTORY: usize = 50;

/// Where a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginKind {
    Local,
    Remote,
    /// State at session start or right after the initial room sync.
    Baseline,
}

/// Deep copy of the nodes and edges at one point in time, ordered by id.
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySnapshot {
    pub nodes: Vec<Entity>,
    pub edges: Vec<Entity>,
    pub origin: OriginKind,
}

impl HistorySnapshot {
    /// Copy the current nodes and edges out of `store`.
    pub fn capture(store: &RecordStore, origin: OriginKind) -> Self {
        Self {
            nodes: store.nodes(),
            edges: store.edges(),
            origin,
        }
    }

    pub fn empty(origin: OriginKind) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            origin,
        }
    }

    pub fn entities(&self, map: MapName) -> &[Entity] {
        match map {
            MapName::Nodes => &self.nodes,
            MapName::Edges => &self.edges,
            MapName::Cursors => &[],
        }
    }

    /// Restore id order, e.g. after building a snapshot by hand.
    pub fn sort_by_id(&mut self) {
        self.nodes.sort_by(|a, b| a.id.cmp(&b.id));
        self.edges.sort_by(|a, b| a.id.cmp(&b.id));
    }

    fn is_sorted_by_id(&self) -> bool {
        [&self.nodes, &self.edges]
            .iter()
            .all(|list| list.windows(2).all(|w| w[0].id <= w[1].id))
    }

    /// Look up an entity. Relies on id order, which [`HistoryStack::push`]
    /// guarantees.
    pub fn get(&self, map: MapName, id: &str) -> Option<&Entity> {
        let entities = self.entities(map);
        entities
            .binary_search_by(|e| e.id.as_str().cmp(id))
            .ok()
            .map(|i| &entities[i])
    }
}

/// Linear history with a cursor.
///
/// `position` always indexes the entry matching the current state; entries
/// after it are the redo tail.
#[derive(Debug, Clone)]
pub struct HistoryStack {
    entries: VecDeque<HistorySnapshot>,
    position: usize,
    max_entries: usize,
}

impl HistoryStack {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            position: 0,
            max_entries: max_entries.max(1),
        }
    }

    /// Drop the redo tail, append, evict from the front over capacity.
    pub fn push(&mut self, mut snapshot: HistorySnapshot) {
        if !snapshot.is_sorted_by_id() {
            snapshot.sort_by_id();
        }
        if !self.entries.is_empty() {
            self.entries.truncate(self.position + 1);
        }
        self.entries.push_back(snapshot);
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
        self.position = self.entries.len() - 1;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.position = 0;
    }

    pub fn can_undo(&self) -> bool {
        !self.entries.is_empty() && self.position > 0
    }

    pub fn can_redo(&self) -> bool {
        !self.entries.is_empty() && self.position + 1 < self.entries.len()
    }

    /// Entry an undo would move to.
    pub fn previous(&self) -> Option<&HistorySnapshot> {
        if self.can_undo() {
            self.entries.get(self.position - 1)
        } else {
            None
        }
    }

    /// Entry a redo would move to.
    pub fn next(&self) -> Option<&HistorySnapshot> {
        if self.can_redo() {
            self.entries.get(self.position + 1)
        } else {
            None
        }
    }

    pub(crate) fn step_back(&mut self) {
        if self.can_undo() {
            self.position -= 1;
        }
    }

    pub(crate) fn step_forward(&mut self) {
        if self.can_redo() {
            self.position += 1;
        }
    }

    pub fn current(&self) -> Option<&HistorySnapshot> {
        self.entries.get(self.position)
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistorySnapshot> {
        self.entries.iter()
    }
}

impl Default for HistoryStack {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Point, Size};

    fn snapshot_with(ids: &[&str]) -> HistorySnapshot {
        HistorySnapshot {
            nodes: ids
                .iter()
                .map(|id| Entity::node(*id, "rect", Point::default(), Size::default(), "A"))
                .collect(),
            edges: Vec::new(),
            origin: OriginKind::Local,
        }
    }

    #[test]
    fn test_empty_stack() {
        let stack = HistoryStack::default();
        assert!(stack.is_empty());
        assert!(!stack.can_undo());
        assert!(!stack.can_redo());
        assert!(stack.current().is_none());
        assert_eq!(stack.max_entries(), DEFAULT_MAX_HISTORY);
    }

    #[test]
    fn test_push_moves_position_to_newest() {
        let mut stack = HistoryStack::default();
        stack.push(snapshot_with(&[]));
        stack.push(snapshot_with(&["n1"]));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.position(), 1);
        assert!(stack.can_undo());
        assert!(!stack.can_redo());
    }

    #[test]
    fn test_bounded_history_evicts_oldest() {
        let mut stack = HistoryStack::new(50);
        for i in 0..60 {
            stack.push(snapshot_with(&[&format!("n{i:02}")]));
        }
        assert_eq!(stack.len(), 50);
        assert_eq!(stack.position(), 49);
        assert_eq!(stack.iter().next().unwrap().nodes[0].id, "n10");
        assert_eq!(stack.current().unwrap().nodes[0].id, "n59");
    }

    #[test]
    fn test_push_truncates_redo_tail() {
        let mut stack = HistoryStack::default();
        stack.push(snapshot_with(&[]));
        stack.push(snapshot_with(&["n1"]));
        stack.push(snapshot_with(&["n1", "n2"]));
        stack.step_back();
        stack.step_back();
        assert_eq!(stack.position(), 0);

        stack.push(snapshot_with(&["n3"]));
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.position(), 1);
        assert!(!stack.can_redo());
    }

    #[test]
    fn test_steps_clamp_at_bounds() {
        let mut stack = HistoryStack::default();
        stack.push(snapshot_with(&[]));
        stack.step_back();
        assert_eq!(stack.position(), 0);
        stack.step_forward();
        assert_eq!(stack.position(), 0);
    }

    #[test]
    fn test_push_sorts_snapshot() {
        let mut stack = HistoryStack::default();
        stack.push(snapshot_with(&["c", "a", "b"]));
        let current = stack.current().unwrap();
        let ids: Vec<&str> = current.nodes.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(current.get(MapName::Nodes, "c").is_some());
    }

    #[test]
    fn test_snapshot_lookup_by_id() {
        let snap = snapshot_with(&["a", "b", "c"]);
        assert_eq!(snap.get(MapName::Nodes, "b").map(|e| e.id.as_str()), Some("b"));
        assert!(snap.get(MapName::Nodes, "z").is_none());
        assert!(snap.get(MapName::Edges, "a").is_none());
    }
}
