//! Surface state and the commit lifecycle
//!
//! A surface carries two state snapshots: *pending* accumulates client
//! requests between commits, *current* is the last atomically-applied state.
//! Current is only ever replaced as a whole, so the compositor never
//! presents a half-updated surface.
//!
//! Map lifecycle: `Uncommitted -> Configuring <-> Mapped -> Unmapped`,
//! with `Destroyed` terminal. A surface becomes `Mapped` only once it has a
//! buffer and an acknowledged configure; `Unmapped` keeps the surface object
//! (and its role) alive with no buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::compositor::app::AppId;
use crate::compositor::buffer::BufferId;
use crate::compositor::geometry::{Rect, Region};

/// Unique identifier for surfaces; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

impl SurfaceId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SurfaceId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Surface role determines how the surface takes part in compositing
///
/// Role assignment is one-shot: once set, a different role is a protocol
/// violation and the offending connection is terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SurfaceRole {
    /// No role assigned yet
    #[default]
    None,
    /// Shell toplevel window
    Toplevel,
    /// Shell popup with a parent surface
    Popup { parent: SurfaceId },
    /// Pointer cursor image
    Cursor,
}

/// Where a surface is in its map lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapState {
    /// Created, no role, nothing committed
    #[default]
    Uncommitted,
    /// Role assigned, awaiting an acknowledged configure
    Configuring,
    /// Has a buffer and an acked configure; eligible for compositing
    Mapped,
    /// Buffer cleared; out of the scene but role and state persist
    Unmapped,
    /// Terminal; id never reused
    Destroyed,
}

/// One double-buffered state snapshot
#[derive(Debug, Clone, Default)]
pub struct SurfaceState {
    /// Attached buffer, if any
    pub buffer: Option<BufferId>,
    /// Buffer size in pixels, recorded at commit
    pub size: (u32, u32),
    /// Attach offset
    pub offset: (i32, i32),
    /// Accumulated damage, surface-local coordinates
    pub damage: Vec<Rect>,
    /// Buffer scale factor (0 = unset in pending)
    pub scale: i32,
    /// Buffer transform
    pub transform: i32,
    /// Input region; None means the whole surface accepts input
    pub input_region: Option<Region>,
    /// Opaque region hint
    pub opaque_region: Option<Region>,
}

/// A configure the server sent and the client has not yet superseded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentConfigure {
    pub serial: u32,
    pub size: (u32, u32),
}

/// Per-surface configure/ack bookkeeping
///
/// Serials are monotonically increasing per surface. An ack must name a
/// serial that is actually outstanding; acking one discards everything older
/// (clients may skip intermediate configures).
#[derive(Debug, Default)]
pub struct ConfigureTracker {
    sent: VecDeque<SentConfigure>,
    acked: Option<SentConfigure>,
    next_serial: u32,
    last_sent: Option<u32>,
}

impl ConfigureTracker {
    pub fn new() -> Self {
        Self {
            sent: VecDeque::new(),
            acked: None,
            next_serial: 1,
            last_sent: None,
        }
    }

    /// Record a configure about to be sent; returns its serial
    pub fn record_sent(&mut self, size: (u32, u32)) -> u32 {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.last_sent = Some(serial);
        self.sent.push_back(SentConfigure { serial, size });
        serial
    }

    /// Acknowledge a configure by serial
    ///
    /// Rejects serials that were never sent or were already retired; the
    /// caller logs and escalates, surface state stays untouched.
    pub fn ack(&mut self, serial: u32) -> Result<SentConfigure, CommitError> {
        let pos = self
            .sent
            .iter()
            .position(|c| c.serial == serial)
            .ok_or(CommitError::InvalidSerial {
                serial,
                last_sent: self.last_sent,
            })?;
        let acked = self.sent[pos];
        self.sent.drain(..=pos);
        self.acked = Some(acked);
        Ok(acked)
    }

    /// The configure the client last acknowledged
    pub fn acked(&self) -> Option<SentConfigure> {
        self.acked
    }

    pub fn last_sent_serial(&self) -> Option<u32> {
        self.last_sent
    }

    /// Count of configures sent but not yet acked or superseded
    pub fn outstanding(&self) -> usize {
        self.sent.len()
    }
}

/// Client protocol violations around roles, serials, and commits
///
/// Each of these terminates only the offending connection; the server keeps
/// running and other clients are unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    #[error("surface already has a different role")]
    RoleConflict,
    #[error("ack references serial {serial} but last sent was {last_sent:?}")]
    InvalidSerial {
        serial: u32,
        last_sent: Option<u32>,
    },
    #[error("popup parent surface is not mapped")]
    ParentNotMapped,
    #[error("unknown surface")]
    UnknownSurface,
    #[error("surface is destroyed")]
    SurfaceDestroyed,
    #[error("attached buffer does not exist")]
    UnknownBuffer,
}

impl From<crate::compositor::buffer::BufferError> for CommitError {
    fn from(_: crate::compositor::buffer::BufferError) -> Self {
        CommitError::UnknownBuffer
    }
}

/// Result of swapping pending state into current
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSwap {
    /// Buffer that left the current state and should drop a hold
    pub released: Option<BufferId>,
    /// Buffer now current and holding a compositor reference
    pub attached: Option<BufferId>,
}

/// A client-visible drawable with double-buffered state
#[derive(Debug)]
pub struct Surface {
    pub id: SurfaceId,
    /// Owning application, once the connection is known
    pub owner: Option<AppId>,
    pub role: SurfaceRole,
    pub map_state: MapState,
    /// State accumulating client requests
    pub pending: SurfaceState,
    /// Last atomically-applied state; only replaced whole
    pub current: SurfaceState,
    pub configure: ConfigureTracker,
    /// True when attach was called since the last commit
    pending_attach: bool,
    /// Frame callbacks queued for the next presented frame
    pub frame_callbacks: Vec<u32>,
}

impl Surface {
    fn new(owner: Option<AppId>) -> Self {
        Self {
            id: SurfaceId::new(),
            owner,
            role: SurfaceRole::None,
            map_state: MapState::Uncommitted,
            pending: SurfaceState::default(),
            current: SurfaceState::default(),
            configure: ConfigureTracker::new(),
            pending_attach: false,
            frame_callbacks: Vec::new(),
        }
    }

    /// Set the surface role; one-shot
    pub fn set_role(&mut self, role: SurfaceRole) -> Result<(), CommitError> {
        if self.role != SurfaceRole::None && self.role != role {
            return Err(CommitError::RoleConflict);
        }
        self.role = role;
        Ok(())
    }

    /// Attach a buffer (or clear it) into the pending state
    pub fn attach(&mut self, buffer: Option<BufferId>, x: i32, y: i32) {
        self.pending.buffer = buffer;
        self.pending.offset = (x, y);
        self.pending_attach = true;
    }

    /// Accumulate damage into the pending state
    pub fn damage(&mut self, x: i32, y: i32, width: u32, height: u32) {
        self.pending.damage.push(Rect::new(x, y, width, height));
    }

    /// Queue a frame callback to fire after the next presented frame
    pub fn frame(&mut self, callback_id: u32) {
        self.frame_callbacks.push(callback_id);
    }

    pub fn set_offset(&mut self, x: i32, y: i32) {
        self.pending.offset = (x, y);
    }

    pub fn set_scale(&mut self, scale: i32) {
        self.pending.scale = scale;
    }

    pub fn set_transform(&mut self, transform: i32) {
        self.pending.transform = transform;
    }

    pub fn set_input_region(&mut self, region: Option<Region>) {
        self.pending.input_region = region;
    }

    pub fn set_opaque_region(&mut self, region: Option<Region>) {
        self.pending.opaque_region = region;
    }

    /// Atomically swap pending state into current
    ///
    /// Only the state machine in [`CompositorState`](crate::compositor::state)
    /// calls this, after validation; the swap itself cannot fail.
    pub(crate) fn apply_pending(&mut self, buffer_size: Option<(u32, u32)>) -> CommitSwap {
        let mut released = None;
        if self.pending_attach {
            if self.current.buffer != self.pending.buffer {
                released = self.current.buffer;
            }
            self.current.buffer = self.pending.buffer;
            self.current.offset = self.pending.offset;
            self.current.size = buffer_size.unwrap_or((0, 0));
            self.pending_attach = false;
        }

        if !self.pending.damage.is_empty() {
            self.current.damage = std::mem::take(&mut self.pending.damage);
        }
        if self.pending.scale != 0 {
            self.current.scale = self.pending.scale;
        }
        self.current.transform = self.pending.transform;
        self.current.input_region = self.pending.input_region.clone();
        self.current.opaque_region = self.pending.opaque_region.clone();

        CommitSwap {
            released,
            attached: self.current.buffer,
        }
    }

    /// Whether an attach is waiting to be committed
    pub fn has_pending_attach(&self) -> bool {
        self.pending_attach
    }

    /// Whether the surface may appear in the scene
    pub fn is_mapped(&self) -> bool {
        self.map_state == MapState::Mapped
    }

    /// Drain queued frame callbacks (fired after a presented frame)
    pub fn take_frame_callbacks(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.frame_callbacks)
    }
}

/// Table of all live surfaces
#[derive(Debug, Default)]
pub struct SurfaceManager {
    surfaces: HashMap<SurfaceId, Surface>,
}

impl SurfaceManager {
    pub fn new() -> Self {
        Self {
            surfaces: HashMap::new(),
        }
    }

    /// Create a new surface and return its id
    pub fn create(&mut self, owner: Option<AppId>) -> SurfaceId {
        let surface = Surface::new(owner);
        let id = surface.id;
        self.surfaces.insert(id, surface);
        id
    }

    pub fn get(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get(&id)
    }

    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.surfaces.get_mut(&id)
    }

    /// Remove a surface from the table entirely
    pub fn remove(&mut self, id: SurfaceId) -> Option<Surface> {
        self.surfaces.remove(&id)
    }

    /// Ids of every surface owned by an application
    pub fn owned_by(&self, app: AppId) -> Vec<SurfaceId> {
        self.surfaces
            .values()
            .filter(|s| s.owner == Some(app))
            .map(|s| s.id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SurfaceId, &Surface)> {
        self.surfaces.iter()
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_ids_unique() {
        let mut manager = SurfaceManager::new();
        let a = manager.create(None);
        let b = manager.create(None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_role_is_one_shot() {
        let mut manager = SurfaceManager::new();
        let id = manager.create(None);
        let surface = manager.get_mut(id).unwrap();

        assert!(surface.set_role(SurfaceRole::Toplevel).is_ok());
        // Same role again is fine
        assert!(surface.set_role(SurfaceRole::Toplevel).is_ok());
        // A different role is a violation
        assert_eq!(
            surface.set_role(SurfaceRole::Cursor),
            Err(CommitError::RoleConflict)
        );
    }

    #[test]
    fn test_configure_serials_monotonic() {
        let mut tracker = ConfigureTracker::new();
        let s1 = tracker.record_sent((100, 100));
        let s2 = tracker.record_sent((200, 200));
        assert!(s2 > s1);
        assert_eq!(tracker.last_sent_serial(), Some(s2));
    }

    #[test]
    fn test_ack_retires_older_configures() {
        let mut tracker = ConfigureTracker::new();
        let _s1 = tracker.record_sent((100, 100));
        let s2 = tracker.record_sent((200, 200));
        let s3 = tracker.record_sent((300, 300));

        // Acking s2 retires s1 as skipped, leaves s3 outstanding
        let acked = tracker.ack(s2).unwrap();
        assert_eq!(acked.size, (200, 200));
        assert_eq!(tracker.outstanding(), 1);

        let acked = tracker.ack(s3).unwrap();
        assert_eq!(acked.size, (300, 300));
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn test_ack_future_serial_rejected() {
        let mut tracker = ConfigureTracker::new();
        let s1 = tracker.record_sent((100, 100));
        assert_eq!(s1, 1);

        // Serial 5 was never sent
        let err = tracker.ack(5).unwrap_err();
        assert_eq!(
            err,
            CommitError::InvalidSerial {
                serial: 5,
                last_sent: Some(1),
            }
        );
        // Nothing changed
        assert_eq!(tracker.acked(), None);
        assert_eq!(tracker.outstanding(), 1);
    }

    #[test]
    fn test_ack_retired_serial_rejected() {
        let mut tracker = ConfigureTracker::new();
        let s1 = tracker.record_sent((100, 100));
        let s2 = tracker.record_sent((200, 200));

        tracker.ack(s2).unwrap();
        // s1 was skipped and retired; acking it now goes backwards
        assert!(tracker.ack(s1).is_err());
        assert_eq!(tracker.acked().unwrap().serial, s2);
    }

    #[test]
    fn test_apply_pending_swaps_whole_state() {
        let mut manager = SurfaceManager::new();
        let id = manager.create(None);
        let surface = manager.get_mut(id).unwrap();

        surface.attach(Some(BufferId(7)), 0, 0);
        surface.damage(0, 0, 50, 50);
        surface.set_scale(2);

        let swap = surface.apply_pending(Some((100, 100)));
        assert_eq!(swap.attached, Some(BufferId(7)));
        assert_eq!(swap.released, None);
        assert_eq!(surface.current.buffer, Some(BufferId(7)));
        assert_eq!(surface.current.size, (100, 100));
        assert_eq!(surface.current.scale, 2);
        assert_eq!(surface.current.damage.len(), 1);
        assert!(surface.pending.damage.is_empty());
    }

    #[test]
    fn test_commit_without_attach_keeps_buffer() {
        let mut manager = SurfaceManager::new();
        let id = manager.create(None);
        let surface = manager.get_mut(id).unwrap();

        surface.attach(Some(BufferId(3)), 0, 0);
        surface.apply_pending(Some((10, 10)));

        // A commit that never attached leaves the current buffer in place
        surface.damage(0, 0, 5, 5);
        let swap = surface.apply_pending(None);
        assert_eq!(swap.released, None);
        assert_eq!(surface.current.buffer, Some(BufferId(3)));
    }

    #[test]
    fn test_replacing_buffer_releases_old() {
        let mut manager = SurfaceManager::new();
        let id = manager.create(None);
        let surface = manager.get_mut(id).unwrap();

        surface.attach(Some(BufferId(1)), 0, 0);
        surface.apply_pending(Some((10, 10)));
        surface.attach(Some(BufferId(2)), 0, 0);
        let swap = surface.apply_pending(Some((10, 10)));
        assert_eq!(swap.released, Some(BufferId(1)));
        assert_eq!(swap.attached, Some(BufferId(2)));
    }

    #[test]
    fn test_owned_by() {
        let mut manager = SurfaceManager::new();
        let app = AppId(42);
        let other = AppId(43);
        let a = manager.create(Some(app));
        let _b = manager.create(Some(other));
        let c = manager.create(Some(app));

        let mut owned = manager.owned_by(app);
        owned.sort_by_key(|s| s.0);
        assert_eq!(owned, vec![a, c]);
    }
}
