//! Record Store and Merge Engine.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────┐      ┌──────────────────────────┐
//! │ document (yrs Doc)           │      │ presence (yrs Doc)       │
//! │   Y.Map "nodes" id → JSON    │      │   Y.Map "cursors" id → JSON
//! │   Y.Map "edges" id → JSON    │      │   (never persisted)      │
//! └──────────────┬───────────────┘      └────────────┬─────────────┘
//!                │ encode_update_v1                  │
//!                └───────────────┬───────────────────┘
//!                                ▼
//!                 DeltaFrame { document, presence }  (bincode)
//! ```
//!
//! Every mutation goes through a [`Transaction`]: writes are staged first and
//! only applied to the yrs documents once the whole batch is known, so one
//! logical operation produces exactly one delta and one observer notification
//! per affected map. Remote deltas are fully decoded (frame and every embedded
//! yrs update) before anything is merged.
//!
//! Merge semantics come from yrs: per key the causally later write wins,
//! concurrent writes are ordered by client id, and updates that arrive before
//! their dependencies are held back until the dependencies are integrated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Map, ReadTxn, StateVector, Transact, Update, WriteTxn};

use crate::model::{CursorRecord, Entity};

/// The three record maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MapName {
    Nodes,
    Edges,
    Cursors,
}

impl MapName {
    pub const ALL: [MapName; 3] = [MapName::Nodes, MapName::Edges, MapName::Cursors];

    pub fn as_str(&self) -> &'static str {
        match self {
            MapName::Nodes => "nodes",
            MapName::Edges => "edges",
            MapName::Cursors => "cursors",
        }
    }

    /// Cursor records live in the presence document.
    pub fn is_presence(&self) -> bool {
        matches!(self, MapName::Cursors)
    }
}

impl fmt::Display for MapName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value stored under a key of one of the maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    Entity(Entity),
    Cursor(CursorRecord),
}

impl Record {
    /// Key the record is stored under.
    pub fn key(&self) -> &str {
        match self {
            Record::Entity(e) => &e.id,
            Record::Cursor(c) => &c.owner_id,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Record::Entity(e) => Some(e),
            Record::Cursor(_) => None,
        }
    }

    pub fn as_cursor(&self) -> Option<&CursorRecord> {
        match self {
            Record::Cursor(c) => Some(c),
            Record::Entity(_) => None,
        }
    }

    pub fn into_entity(self) -> Option<Entity> {
        match self {
            Record::Entity(e) => Some(e),
            Record::Cursor(_) => None,
        }
    }

    pub fn into_cursor(self) -> Option<CursorRecord> {
        match self {
            Record::Cursor(c) => Some(c),
            Record::Entity(_) => None,
        }
    }

    fn fits(&self, map: MapName) -> bool {
        match self {
            Record::Entity(_) => !map.is_presence(),
            Record::Cursor(_) => map.is_presence(),
        }
    }

    fn is_finite(&self) -> bool {
        match self {
            Record::Entity(e) => e.is_finite(),
            Record::Cursor(c) => c.is_finite(),
        }
    }

    fn to_json(&self) -> Result<String, StoreError> {
        let json = match self {
            Record::Entity(e) => serde_json::to_string(e),
            Record::Cursor(c) => serde_json::to_string(c),
        };
        json.map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn from_json(map: MapName, json: &str) -> Result<Self, serde_json::Error> {
        if map.is_presence() {
            serde_json::from_str(json).map(Record::Cursor)
        } else {
            serde_json::from_str(json).map(Record::Entity)
        }
    }
}

impl From<Entity> for Record {
    fn from(e: Entity) -> Self {
        Record::Entity(e)
    }
}

impl From<CursorRecord> for Record {
    fn from(c: CursorRecord) -> Self {
        Record::Cursor(c)
    }
}

/// A single-key change for [`RecordStore::apply_local_mutation`].
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Put(Record),
    Delete,
}

/// Record store errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Malformed delta or snapshot bytes
    #[error("Decode error: {0}")]
    Decode(String),
    /// Record or frame could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),
    /// yrs rejected a decoded update
    #[error("Apply error: {0}")]
    Apply(String),
    /// Entity written to the cursor map or vice versa
    #[error("Record does not belong in map {0}")]
    WrongMap(MapName),
    /// NaN or infinite number; JSON would silently turn it into `null`
    #[error("Record {0} contains a non-finite number")]
    NonFinite(String),
}

/// Encoded delta, ready to be broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta(Vec<u8>);

impl Delta {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether encoded delta `bytes` carry node or edge changes, as opposed
    /// to cursor changes only. Malformed input yields `false`.
    pub fn touches_document(bytes: &[u8]) -> bool {
        DeltaFrame::decode(bytes)
            .map(|frame| frame.document.is_some())
            .unwrap_or(false)
    }
}

impl AsRef<[u8]> for Delta {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Wire frame for deltas: one optional yrs update per document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DeltaFrame {
    document: Option<Vec<u8>>,
    presence: Option<Vec<u8>>,
}

impl DeltaFrame {
    fn is_empty(&self) -> bool {
        self.document.is_none() && self.presence.is_none()
    }

    fn encode(&self) -> Result<Delta, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map(Delta)
            .map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (frame, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        if read != bytes.len() {
            return Err(StoreError::Decode(format!(
                "{} trailing bytes after delta frame",
                bytes.len() - read
            )));
        }
        Ok(frame)
    }
}

/// Handle returned by [`RecordStore::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverFn = Box<dyn FnMut(&[Record]) + Send>;

struct Observer {
    id: ObserverId,
    map: MapName,
    callback: ObserverFn,
}

#[derive(Debug, Clone)]
enum Staged {
    Put { record: Record, json: String },
    Delete,
}

/// A batch of writes against the store.
///
/// Reads see the batch's own staged writes. Nothing reaches the yrs documents
/// until the closure passed to [`RecordStore::transact`] returns `Ok`.
pub struct Transaction<'s> {
    store: &'s RecordStore,
    staged: BTreeMap<(MapName, String), Staged>,
}

impl<'s> Transaction<'s> {
    fn new(store: &'s RecordStore) -> Self {
        Self {
            store,
            staged: BTreeMap::new(),
        }
    }

    /// Stage an upsert of `record` under its own key.
    pub fn put(&mut self, map: MapName, record: impl Into<Record>) -> Result<(), StoreError> {
        let record = record.into();
        let key = record.key().to_string();
        self.put_at(map, key, record)
    }

    /// Stage an upsert under an explicit key.
    pub fn put_at(
        &mut self,
        map: MapName,
        key: impl Into<String>,
        record: Record,
    ) -> Result<(), StoreError> {
        if !record.fits(map) {
            return Err(StoreError::WrongMap(map));
        }
        let key = key.into();
        if !record.is_finite() {
            return Err(StoreError::NonFinite(key));
        }
        let json = record.to_json()?;
        self.staged.insert((map, key), Staged::Put { record, json });
        Ok(())
    }

    pub fn put_node(&mut self, node: Entity) -> Result<(), StoreError> {
        self.put(MapName::Nodes, node)
    }

    pub fn put_edge(&mut self, edge: Entity) -> Result<(), StoreError> {
        self.put(MapName::Edges, edge)
    }

    pub fn put_cursor(&mut self, cursor: CursorRecord) -> Result<(), StoreError> {
        self.put(MapName::Cursors, cursor)
    }

    /// Stage a removal. Returns whether the key exists in this transaction's view.
    pub fn remove(&mut self, map: MapName, key: &str) -> bool {
        let existed = self.get(map, key).is_some();
        self.staged.insert((map, key.to_string()), Staged::Delete);
        existed
    }

    pub fn get(&self, map: MapName, key: &str) -> Option<Record> {
        match self.staged.get(&(map, key.to_string())) {
            Some(Staged::Put { record, .. }) => Some(record.clone()),
            Some(Staged::Delete) => None,
            None => self.store.get(map, key),
        }
    }

    pub fn entity(&self, map: MapName, id: &str) -> Option<Entity> {
        self.get(map, id).and_then(Record::into_entity)
    }

    /// Current records of `map`, staged writes included, sorted by key.
    pub fn records(&self, map: MapName) -> Vec<Record> {
        let mut view: BTreeMap<String, Record> = self.store.record_map(map);
        for ((staged_map, key), write) in &self.staged {
            if *staged_map != map {
                continue;
            }
            match write {
                Staged::Put { record, .. } => {
                    view.insert(key.clone(), record.clone());
                }
                Staged::Delete => {
                    view.remove(key);
                }
            }
        }
        view.into_values().collect()
    }

    pub fn entities(&self, map: MapName) -> Vec<Entity> {
        self.records(map)
            .into_iter()
            .filter_map(Record::into_entity)
            .collect()
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}

/// The shared diagram state of one replica: node, edge and cursor maps.
///
/// All mutating entry points take `&mut self`, so a store is single-writer by
/// construction; callers sharing one across tasks wrap it in a mutex.
pub struct RecordStore {
    /// Nodes and edges; the persisted part.
    document: Doc,
    /// Cursors; ephemeral.
    presence: Doc,
    observers: Vec<Observer>,
    next_observer_id: u64,
}

impl RecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            document: Doc::new(),
            presence: Doc::new(),
            observers: Vec::new(),
            next_observer_id: 0,
        }
    }

    /// Create a store from a snapshot produced by [`encode_full_state`].
    ///
    /// [`encode_full_state`]: RecordStore::encode_full_state
    pub fn from_snapshot(snapshot: &[u8]) -> Result<Self, StoreError> {
        let mut store = Self::new();
        store.decode_and_load_full_state(snapshot)?;
        Ok(store)
    }

    fn doc(&self, map: MapName) -> &Doc {
        if map.is_presence() {
            &self.presence
        } else {
            &self.document
        }
    }

    // ─── Mutation ─────────────────────────────────────────────────────

    /// Set or remove a single key.
    ///
    /// Returns the delta for exactly this change, or `None` when the store
    /// already reflected it.
    pub fn apply_local_mutation(
        &mut self,
        map: MapName,
        key: &str,
        mutation: Mutation,
    ) -> Result<Option<Delta>, StoreError> {
        self.transact(|tx| {
            match mutation {
                Mutation::Put(record) => tx.put_at(map, key, record)?,
                Mutation::Delete => {
                    tx.remove(map, key);
                }
            }
            Ok(())
        })
    }

    /// Run a batch of writes as one transaction.
    ///
    /// If `f` fails nothing is applied. Otherwise all staged writes are
    /// merged, observers of each changed map are notified once, and the
    /// combined delta is returned (`None` if nothing actually changed).
    pub fn transact<F>(&mut self, f: F) -> Result<Option<Delta>, StoreError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<(), StoreError>,
    {
        let staged = {
            let mut tx = Transaction::new(self);
            f(&mut tx)?;
            tx.staged
        };
        if staged.is_empty() {
            return Ok(None);
        }
        self.commit(staged)
    }

    fn commit(
        &mut self,
        staged: BTreeMap<(MapName, String), Staged>,
    ) -> Result<Option<Delta>, StoreError> {
        let mut frame = DeltaFrame::default();
        let mut changed: Vec<MapName> = Vec::new();

        for presence in [false, true] {
            let writes: Vec<_> = staged
                .iter()
                .filter(|((map, _), _)| map.is_presence() == presence)
                .collect();
            if writes.is_empty() {
                continue;
            }

            let doc = if presence { &self.presence } else { &self.document };
            let mut txn = doc.transact_mut();
            let mut touched = false;

            for ((map, key), write) in writes {
                let target = txn.get_or_insert_map(map.as_str());
                let did_change = match write {
                    Staged::Put { json, .. } => {
                        let current = target.get(&txn, key).map(|v| v.to_string(&txn));
                        if current.as_deref() == Some(json.as_str()) {
                            false
                        } else {
                            target.insert(&mut txn, key.as_str(), json.clone());
                            true
                        }
                    }
                    Staged::Delete => target.remove(&mut txn, key).is_some(),
                };
                if did_change {
                    touched = true;
                    if !changed.contains(map) {
                        changed.push(*map);
                    }
                }
            }

            if touched {
                let update = txn.encode_update_v1();
                if presence {
                    frame.presence = Some(update);
                } else {
                    frame.document = Some(update);
                }
            }
        }

        self.notify(&changed);

        if frame.is_empty() {
            return Ok(None);
        }
        frame.encode().map(Some)
    }

    /// Merge a delta received from a peer.
    ///
    /// The frame and every embedded update are decoded before anything is
    /// applied; malformed input leaves the store untouched. Applying a delta
    /// that is already reflected changes nothing and notifies nobody.
    pub fn apply_remote_delta(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let frame = DeltaFrame::decode(bytes)?;
        let document = decode_update(frame.document.as_deref())?;
        let presence = decode_update(frame.presence.as_deref())?;

        let mut watched: Vec<MapName> = Vec::new();
        if document.is_some() {
            watched.extend([MapName::Nodes, MapName::Edges]);
        }
        if presence.is_some() {
            watched.push(MapName::Cursors);
        }
        let before = self.observed_state(&watched);

        let mut result = Ok(());
        if let Some(update) = document {
            result = apply_update(&self.document, update);
        }
        if let Some(update) = presence {
            let applied = apply_update(&self.presence, update);
            if result.is_ok() {
                result = applied;
            }
        }

        let changed: Vec<MapName> = before
            .into_iter()
            .filter(|(map, raw)| *raw != self.raw_entries(*map))
            .map(|(map, _)| map)
            .collect();
        self.notify(&changed);

        result
    }

    /// Encode nodes and edges as one snapshot. Cursors are never included.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.document.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge a snapshot produced by [`encode_full_state`] into this store.
    ///
    /// [`encode_full_state`]: RecordStore::encode_full_state
    pub fn decode_and_load_full_state(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let update = Update::decode_v1(bytes).map_err(|e| StoreError::Decode(e.to_string()))?;
        let watched = [MapName::Nodes, MapName::Edges];
        let before = self.observed_state(&watched);

        let result = apply_update(&self.document, update);

        let changed: Vec<MapName> = before
            .into_iter()
            .filter(|(map, raw)| *raw != self.raw_entries(*map))
            .map(|(map, _)| map)
            .collect();
        self.notify(&changed);
        result
    }

    /// Full document and presence state as a delta, for late joiners.
    pub fn encode_sync_state(&self) -> Result<Delta, StoreError> {
        let presence = {
            let txn = self.presence.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        DeltaFrame {
            document: Some(self.encode_full_state()),
            presence: Some(presence),
        }
        .encode()
    }

    /// What this store holds that another replica lacks.
    ///
    /// `remote_state` is that replica's [`encode_sync_state`]. The returned
    /// delta carries every update and deletion missing from it, including
    /// local updates whose delivery was lost. Returns `None` when merging
    /// this store into the remote state would change nothing.
    ///
    /// [`encode_sync_state`]: RecordStore::encode_sync_state
    pub fn encode_diff(&self, remote_state: &[u8]) -> Result<Option<Delta>, StoreError> {
        let frame = DeltaFrame::decode(remote_state)?;
        let remote_document = decode_update(frame.document.as_deref())?;
        let remote_presence = decode_update(frame.presence.as_deref())?;

        let diff = DeltaFrame {
            document: missing_from(
                &self.document,
                remote_document,
                &[MapName::Nodes, MapName::Edges],
            )?,
            presence: missing_from(&self.presence, remote_presence, &[MapName::Cursors])?,
        };
        if diff.is_empty() {
            return Ok(None);
        }
        diff.encode().map(Some)
    }

    // ─── Observers ────────────────────────────────────────────────────

    /// Register a callback for `map`.
    ///
    /// It runs once per committed local or remote batch that changed the map
    /// and receives every record currently in it, sorted by key.
    pub fn observe<F>(&mut self, map: MapName, callback: F) -> ObserverId
    where
        F: FnMut(&[Record]) + Send + 'static,
    {
        let id = ObserverId(self.next_observer_id);
        self.next_observer_id += 1;
        self.observers.push(Observer {
            id,
            map,
            callback: Box::new(callback),
        });
        id
    }

    /// Remove an observer. Returns `false` if it was already gone.
    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|o| o.id != id);
        self.observers.len() != before
    }

    pub fn observer_count(&self, map: MapName) -> usize {
        self.observers.iter().filter(|o| o.map == map).count()
    }

    /// Raw entries of the maps that have observers, for change detection.
    fn observed_state(&self, maps: &[MapName]) -> Vec<(MapName, BTreeMap<String, String>)> {
        maps.iter()
            .filter(|map| self.observer_count(**map) > 0)
            .map(|map| (*map, self.raw_entries(*map)))
            .collect()
    }

    fn notify(&mut self, changed: &[MapName]) {
        for map in changed {
            if self.observer_count(*map) == 0 {
                continue;
            }
            let records = self.records(*map);
            for observer in self.observers.iter_mut().filter(|o| o.map == *map) {
                (observer.callback)(&records);
            }
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    fn raw_entries(&self, map: MapName) -> BTreeMap<String, String> {
        doc_entries(self.doc(map), map)
    }

    fn record_map(&self, map: MapName) -> BTreeMap<String, Record> {
        self.raw_entries(map)
            .into_iter()
            .filter_map(|(key, json)| match Record::from_json(map, &json) {
                Ok(record) => Some((key, record)),
                Err(e) => {
                    log::warn!("Skipping undecodable record {map}/{key}: {e}");
                    None
                }
            })
            .collect()
    }

    /// Every record of `map`, sorted by key.
    pub fn records(&self, map: MapName) -> Vec<Record> {
        self.record_map(map).into_values().collect()
    }

    pub fn get(&self, map: MapName, key: &str) -> Option<Record> {
        let txn = self.doc(map).transact();
        let json = txn.get_map(map.as_str())?.get(&txn, key)?.to_string(&txn);
        Record::from_json(map, &json).ok()
    }

    pub fn entity(&self, map: MapName, id: &str) -> Option<Entity> {
        self.get(map, id).and_then(Record::into_entity)
    }

    pub fn contains(&self, map: MapName, key: &str) -> bool {
        let txn = self.doc(map).transact();
        txn.get_map(map.as_str())
            .map(|target| target.contains_key(&txn, key))
            .unwrap_or(false)
    }

    pub fn len(&self, map: MapName) -> usize {
        let txn = self.doc(map).transact();
        txn.get_map(map.as_str())
            .map(|target| target.len(&txn) as usize)
            .unwrap_or(0)
    }

    pub fn nodes(&self) -> Vec<Entity> {
        self.entities(MapName::Nodes)
    }

    pub fn edges(&self) -> Vec<Entity> {
        self.entities(MapName::Edges)
    }

    pub fn entities(&self, map: MapName) -> Vec<Entity> {
        self.records(map)
            .into_iter()
            .filter_map(Record::into_entity)
            .collect()
    }

    pub fn cursors(&self) -> Vec<CursorRecord> {
        self.records(MapName::Cursors)
            .into_iter()
            .filter_map(Record::into_cursor)
            .collect()
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStore")
            .field("nodes", &self.len(MapName::Nodes))
            .field("edges", &self.len(MapName::Edges))
            .field("cursors", &self.len(MapName::Cursors))
            .field("observers", &self.observers.len())
            .finish()
    }
}

fn decode_update(bytes: Option<&[u8]>) -> Result<Option<Update>, StoreError> {
    bytes
        .map(Update::decode_v1)
        .transpose()
        .map_err(|e| StoreError::Decode(e.to_string()))
}

fn apply_update(doc: &Doc, update: Update) -> Result<(), StoreError> {
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|e| StoreError::Apply(e.to_string()))
}

fn doc_entries(doc: &Doc, map: MapName) -> BTreeMap<String, String> {
    let txn = doc.transact();
    match txn.get_map(map.as_str()) {
        Some(target) => target
            .iter(&txn)
            .map(|(key, value)| (key.to_string(), value.to_string(&txn)))
            .collect(),
        None => BTreeMap::new(),
    }
}

/// Update bringing a replica holding `remote` up to `local`, if it needs one.
///
/// The remote state is rebuilt in a scratch doc. The local update is encoded
/// against its state vector and applied there; if neither the state vector
/// nor the visible entries move, nothing is missing.
fn missing_from(
    local: &Doc,
    remote: Option<Update>,
    maps: &[MapName],
) -> Result<Option<Vec<u8>>, StoreError> {
    let replica = Doc::new();
    if let Some(update) = remote {
        apply_update(&replica, update)?;
    }
    let observe = |doc: &Doc| -> (StateVector, Vec<BTreeMap<String, String>>) {
        let sv = doc.transact().state_vector();
        let entries = maps.iter().map(|map| doc_entries(doc, *map)).collect();
        (sv, entries)
    };

    let before = observe(&replica);
    let update = local.transact().encode_state_as_update_v1(&before.0);
    let decoded = Update::decode_v1(&update).map_err(|e| StoreError::Decode(e.to_string()))?;
    apply_update(&replica, decoded)?;

    if observe(&replica) == before {
        Ok(None)
    } else {
        Ok(Some(update))
    }
}
