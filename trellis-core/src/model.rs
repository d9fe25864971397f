//! Diagram records held by the shared store.
//!
//! ```text
//! Entity ── id, kind
//!        ├─ geometry  (Node { position, size } | Edge { source, target, waypoints })
//!        ├─ payload   (schema-less key/value map)
//!        └─ ownership (created_by, last_modified_by, last_modified_at)
//! ```
//!
//! Cursor records live in their own map and are never persisted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Identifier of a node or edge, unique within its map.
pub type EntityId = String;

/// Identifier of a user (as issued by the auth collaborator).
pub type UserId = String;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_finite(&self) -> bool {
        self.width.is_finite() && self.height.is_finite()
    }
}

/// Visible region of a client, in document coordinates.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Viewport {
    pub origin: Point,
    pub size: Size,
    pub zoom: f64,
}

impl Viewport {
    pub fn is_finite(&self) -> bool {
        self.origin.is_finite() && self.size.is_finite() && self.zoom.is_finite()
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            origin: Point::default(),
            size: Size::default(),
            zoom: 1.0,
        }
    }
}

/// Schema-less payload value attached to diagram entities.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum PayloadValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<PayloadValue>),
    Map(BTreeMap<String, PayloadValue>),
}

impl PayloadValue {
    /// JSON has no NaN or infinity; such floats would not survive storage.
    pub fn is_finite(&self) -> bool {
        match self {
            PayloadValue::Float(v) => v.is_finite(),
            PayloadValue::List(items) => items.iter().all(PayloadValue::is_finite),
            PayloadValue::Map(entries) => entries.values().all(PayloadValue::is_finite),
            _ => true,
        }
    }
}

impl From<bool> for PayloadValue {
    fn from(v: bool) -> Self {
        PayloadValue::Bool(v)
    }
}

impl From<i64> for PayloadValue {
    fn from(v: i64) -> Self {
        PayloadValue::Int(v)
    }
}

impl From<f64> for PayloadValue {
    fn from(v: f64) -> Self {
        PayloadValue::Float(v)
    }
}

impl From<&str> for PayloadValue {
    fn from(v: &str) -> Self {
        PayloadValue::Text(v.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(v: String) -> Self {
        PayloadValue::Text(v)
    }
}

pub type Payload = BTreeMap<String, PayloadValue>;

/// Node placement or edge endpoints.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum Geometry {
    Node {
        position: Point,
        size: Size,
    },
    Edge {
        source: EntityId,
        target: EntityId,
        #[serde(default)]
        waypoints: Vec<Point>,
    },
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Ownership {
    pub created_by: UserId,
    pub last_modified_by: UserId,
    pub last_modified_at: u64,
}

impl Ownership {
    pub fn new(user: impl Into<UserId>) -> Self {
        let user = user.into();
        Self {
            created_by: user.clone(),
            last_modified_by: user,
            last_modified_at: now_millis(),
        }
    }
}

/// A node or an edge of the diagram.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub kind: String,
    pub geometry: Geometry,
    #[serde(default)]
    pub payload: Payload,
    pub ownership: Ownership,
}

impl Entity {
    /// Create a node owned by `created_by`.
    pub fn node(
        id: impl Into<EntityId>,
        kind: impl Into<String>,
        position: Point,
        size: Size,
        created_by: impl Into<UserId>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            geometry: Geometry::Node { position, size },
            payload: Payload::new(),
            ownership: Ownership::new(created_by),
        }
    }

    /// Create an edge between two nodes, owned by `created_by`.
    pub fn edge(
        id: impl Into<EntityId>,
        kind: impl Into<String>,
        source: impl Into<EntityId>,
        target: impl Into<EntityId>,
        created_by: impl Into<UserId>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            geometry: Geometry::Edge {
                source: source.into(),
                target: target.into(),
                waypoints: Vec::new(),
            },
            payload: Payload::new(),
            ownership: Ownership::new(created_by),
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn created_by(&self) -> &str {
        &self.ownership.created_by
    }

    pub fn is_node(&self) -> bool {
        matches!(self.geometry, Geometry::Node { .. })
    }

    /// Whether every coordinate and payload float is finite.
    pub fn is_finite(&self) -> bool {
        let geometry = match &self.geometry {
            Geometry::Node { position, size } => position.is_finite() && size.is_finite(),
            Geometry::Edge { waypoints, .. } => waypoints.iter().all(Point::is_finite),
        };
        geometry && self.payload.values().all(PayloadValue::is_finite)
    }

    /// Stamp the modification metadata. `created_by` is never rewritten.
    pub fn touch(&mut self, user: &str, at: u64) {
        self.ownership.last_modified_by = user.to_string();
        self.ownership.last_modified_at = at;
    }

    /// Move a node. No-op for edges.
    pub fn move_to(&mut self, to: Point) {
        if let Geometry::Node { position, .. } = &mut self.geometry {
            *position = to;
        }
    }
}

/// Ephemeral presence entry, keyed by `owner_id` in the cursor map.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct CursorRecord {
    pub owner_id: UserId,
    pub position: Point,
    pub viewport: Viewport,
    pub timestamp: u64,
    #[serde(default)]
    pub name: String,
    /// RGBA
    #[serde(default)]
    pub color: [f32; 4],
}

impl CursorRecord {
    pub fn is_finite(&self) -> bool {
        self.position.is_finite()
            && self.viewport.is_finite()
            && self.color.iter().all(|c| c.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_constructor() {
        let node = Entity::node("n1", "rect", Point::new(10.0, 20.0), Size::new(100.0, 50.0), "A");
        assert!(node.is_node());
        assert_eq!(node.created_by(), "A");
        assert_eq!(node.ownership.last_modified_by, "A");
        assert!(node.payload.is_empty());
    }

    #[test]
    fn test_touch_keeps_creator() {
        let mut node = Entity::node("n1", "rect", Point::default(), Size::default(), "A");
        node.touch("B", 42);
        assert_eq!(node.created_by(), "A");
        assert_eq!(node.ownership.last_modified_by, "B");
        assert_eq!(node.ownership.last_modified_at, 42);
    }

    #[test]
    fn test_move_to_ignores_edges() {
        let mut edge = Entity::edge("e1", "arrow", "n1", "n2", "A");
        let before = edge.clone();
        edge.move_to(Point::new(5.0, 5.0));
        assert_eq!(edge, before);

        let mut node = Entity::node("n1", "rect", Point::default(), Size::default(), "A");
        node.move_to(Point::new(5.0, 6.0));
        match node.geometry {
            Geometry::Node { position, .. } => assert_eq!(position, Point::new(5.0, 6.0)),
            _ => panic!("Wrong geometry"),
        }
    }

    #[test]
    fn test_payload_json_shape() {
        let node = Entity::node("n1", "rect", Point::default(), Size::default(), "A")
            .with_payload("label", "Start")
            .with_payload("weight", 3i64);

        let json = serde_json::to_string(&node).unwrap();
        let back: Entity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
        assert_eq!(back.payload.get("label"), Some(&PayloadValue::Text("Start".into())));
    }

    #[test]
    fn test_non_finite_detection() {
        let node = Entity::node("n1", "rect", Point::new(1.0, 2.0), Size::new(3.0, 4.0), "A");
        assert!(node.is_finite());

        let mut moved = node.clone();
        moved.move_to(Point::new(f64::NAN, 0.0));
        assert!(!moved.is_finite());

        let mut nested = BTreeMap::new();
        nested.insert("w".to_string(), PayloadValue::Float(f64::INFINITY));
        let weighted = node.with_payload("style", PayloadValue::List(vec![PayloadValue::Map(nested)]));
        assert!(!weighted.is_finite());

        let mut edge = Entity::edge("e1", "arrow", "n1", "n2", "A");
        if let Geometry::Edge { waypoints, .. } = &mut edge.geometry {
            waypoints.push(Point::new(0.0, f64::NEG_INFINITY));
        }
        assert!(!edge.is_finite());
    }

    #[test]
    fn test_nested_payload() {
        let mut inner = BTreeMap::new();
        inner.insert("fill".to_string(), PayloadValue::from("#ff0000"));
        let value = PayloadValue::List(vec![PayloadValue::Map(inner), PayloadValue::Null]);

        let json = serde_json::to_string(&value).unwrap();
        let back: PayloadValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
