//! Presence channel: cursors of connected users.
//!
//! Cursor records ride in the presence document of the [`RecordStore`], so
//! they merge and broadcast like any other delta but are never part of a
//! persisted snapshot. Removal is driven by session disconnect, not by
//! timeouts.

use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::model::{now_millis, CursorRecord, Point, Viewport};
use crate::store::{Delta, MapName, Mutation, Record, RecordStore, StoreError};

/// Minimum interval between cursor broadcasts (~30 fps).
pub const DEFAULT_CURSOR_INTERVAL: Duration = Duration::from_millis(33);

/// What a client publishes about itself.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceUpdate {
    pub position: Point,
    pub viewport: Viewport,
    pub name: String,
}

/// Upsert the cursor of `owner_id`, stamped with the current time.
///
/// Throttling is up to the caller; see [`CursorThrottle`].
pub fn publish_presence(
    store: &mut RecordStore,
    owner_id: &str,
    update: PresenceUpdate,
) -> Result<Option<Delta>, StoreError> {
    let cursor = CursorRecord {
        owner_id: owner_id.to_string(),
        position: update.position,
        viewport: update.viewport,
        timestamp: now_millis(),
        name: update.name,
        color: CursorColor::for_user(owner_id).to_array(),
    };
    store.apply_local_mutation(
        MapName::Cursors,
        owner_id,
        Mutation::Put(Record::Cursor(cursor)),
    )
}

/// Remove the cursor of a user whose session ended.
pub fn on_peer_left(store: &mut RecordStore, owner_id: &str) -> Result<Option<Delta>, StoreError> {
    store.apply_local_mutation(MapName::Cursors, owner_id, Mutation::Delete)
}

/// Every cursor except the caller's own.
pub fn own_entries_filter(cursors: &[CursorRecord], self_id: &str) -> Vec<CursorRecord> {
    cursors
        .iter()
        .filter(|c| c.owner_id != self_id)
        .cloned()
        .collect()
}

/// Rate limiter for outgoing cursor updates.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl CursorThrottle {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_CURSOR_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Returns `true` and arms the throttle if an update may go out now.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    /// Allow the next update through regardless of timing.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

impl Default for CursorThrottle {
    fn default() -> Self {
        Self::new()
    }
}

/// RGBA cursor color.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color for a user id.
    ///
    /// The id is hashed into a name-based UUID and the hue taken from it, so
    /// every replica picks the same color without coordination.
    pub fn for_user(user_id: &str) -> Self {
        let hash = Uuid::new_v5(&Uuid::NAMESPACE_OID, user_id.as_bytes()).as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
