//! Window records
//!
//! A window record is the compositor-side bookkeeping for one on-screen
//! toplevel. Records are owned exclusively by the application record of the
//! client that created them; the back-reference to the owner is an id, never
//! a pointer.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::compositor::app::AppId;
use crate::compositor::geometry::Rect;
use crate::compositor::surface::SurfaceId;

/// Unique identifier for windows; never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub u64);

impl WindowId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        WindowId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

bitflags! {
    /// Window state flags, advertised to the client in configure events
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WindowStateFlags: u32 {
        const MAXIMIZED  = 1 << 0;
        const FULLSCREEN = 1 << 1;
        const RESIZING   = 1 << 2;
        const ACTIVATED  = 1 << 3;
    }
}

/// One on-screen window belonging to an application record
#[derive(Debug)]
pub struct WindowRecord {
    pub id: WindowId,
    /// Owning application; id back-reference only
    pub app: AppId,
    /// The buffer-bearing surface behind this window
    pub surface: SurfaceId,
    pub title: Option<String>,
    /// Position and size in global coordinates
    pub geometry: Rect,
    /// Minimum size (0 = no minimum)
    pub min_size: (u32, u32),
    /// Maximum size (0 = no maximum)
    pub max_size: (u32, u32),
    pub states: WindowStateFlags,
    /// Parent window for transient windows
    pub parent: Option<WindowId>,
}

impl WindowRecord {
    pub fn new(app: AppId, surface: SurfaceId) -> Self {
        Self {
            id: WindowId::new(),
            app,
            surface,
            title: None,
            geometry: Rect::default(),
            min_size: (0, 0),
            max_size: (0, 0),
            states: WindowStateFlags::empty(),
            parent: None,
        }
    }

    pub fn set_title(&mut self, title: String) {
        self.title = Some(title);
    }

    pub fn set_geometry(&mut self, geometry: Rect) {
        self.geometry = geometry;
    }

    pub fn set_min_size(&mut self, width: u32, height: u32) {
        self.min_size = (width, height);
    }

    pub fn set_max_size(&mut self, width: u32, height: u32) {
        self.max_size = (width, height);
    }

    /// Set or clear a state flag; returns true if the flags changed
    pub fn set_state(&mut self, flag: WindowStateFlags, value: bool) -> bool {
        let before = self.states;
        self.states.set(flag, value);
        self.states != before
    }

    pub fn is_activated(&self) -> bool {
        self.states.contains(WindowStateFlags::ACTIVATED)
    }

    /// Encode state flags as the xdg_toplevel states array (u32 LE values)
    pub fn states_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        // xdg_toplevel::State values: 1 maximized, 2 fullscreen, 3 resizing, 4 activated
        for (flag, value) in [
            (WindowStateFlags::MAXIMIZED, 1u32),
            (WindowStateFlags::FULLSCREEN, 2u32),
            (WindowStateFlags::RESIZING, 3u32),
            (WindowStateFlags::ACTIVATED, 4u32),
        ] {
            if self.states.contains(flag) {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_ids_unique() {
        let a = WindowRecord::new(AppId(1), SurfaceId(1));
        let b = WindowRecord::new(AppId(1), SurfaceId(2));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_window_back_reference() {
        let window = WindowRecord::new(AppId(7), SurfaceId(3));
        assert_eq!(window.app, AppId(7));
        assert_eq!(window.surface, SurfaceId(3));
        assert!(window.title.is_none());
    }

    #[test]
    fn test_set_state_reports_change() {
        let mut window = WindowRecord::new(AppId(1), SurfaceId(1));
        assert!(window.set_state(WindowStateFlags::ACTIVATED, true));
        assert!(!window.set_state(WindowStateFlags::ACTIVATED, true));
        assert!(window.is_activated());
        assert!(window.set_state(WindowStateFlags::ACTIVATED, false));
        assert!(!window.is_activated());
    }

    #[test]
    fn test_states_wire_encoding() {
        let mut window = WindowRecord::new(AppId(1), SurfaceId(1));
        window.set_state(WindowStateFlags::MAXIMIZED, true);
        window.set_state(WindowStateFlags::ACTIVATED, true);
        let wire = window.states_wire();
        assert_eq!(wire.len(), 8);
        assert_eq!(&wire[0..4], &1u32.to_le_bytes());
        assert_eq!(&wire[4..8], &4u32.to_le_bytes());
    }
}
