//! Output records and per-output frame pacing
//!
//! Each output owns a damage flag and a single in-flight frame slot. A frame
//! is composited only when damage is pending and the previous present has
//! signalled completion, which bounds latency to one frame in flight per
//! output and prevents unbounded queuing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::compositor::geometry::Rect;

/// Unique identifier for outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId(pub u64);

impl OutputId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        OutputId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// An output mode (resolution + refresh rate)
#[derive(Debug, Clone, Copy)]
pub struct OutputMode {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Refresh rate in mHz (e.g., 60000 for 60Hz)
    pub refresh: u32,
    pub preferred: bool,
}

/// A display sink (monitor/CRTC)
#[derive(Debug)]
pub struct Output {
    pub id: OutputId,
    /// Connector name (e.g., "eDP-1", "headless-1")
    pub name: String,
    pub make: String,
    pub model: String,
    /// Position and size in the global coordinate space
    pub geometry: Rect,
    /// Physical size in millimeters
    pub physical_size: (u32, u32),
    pub modes: Vec<OutputMode>,
    pub current_mode: Option<usize>,
    pub scale: i32,
    /// Something visible changed since the last presented frame
    damaged: bool,
    /// A composite has been issued and its frame-done has not arrived
    frame_pending: bool,
}

impl Output {
    pub fn new(name: String, make: String, model: String) -> Self {
        Self {
            id: OutputId::new(),
            name,
            make,
            model,
            geometry: Rect::default(),
            physical_size: (0, 0),
            modes: Vec::new(),
            current_mode: None,
            scale: 1,
            damaged: false,
            frame_pending: false,
        }
    }

    /// Add a mode; the first one added becomes current
    pub fn add_mode(&mut self, mode: OutputMode) {
        self.modes.push(mode);
        if self.current_mode.is_none() {
            self.current_mode = Some(self.modes.len() - 1);
            self.geometry.width = mode.width;
            self.geometry.height = mode.height;
        }
    }

    pub fn current_mode(&self) -> Option<&OutputMode> {
        self.current_mode.and_then(|i| self.modes.get(i))
    }

    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    /// Refresh interval of the current mode in milliseconds (fallback 60Hz)
    pub fn refresh_interval_ms(&self) -> u64 {
        let refresh = self.current_mode().map(|m| m.refresh).unwrap_or(60_000);
        if refresh == 0 {
            return 16;
        }
        (1_000_000 / refresh as u64).max(1)
    }

    /// Note that visible state on this output changed
    pub fn mark_damaged(&mut self) {
        self.damaged = true;
    }

    pub fn is_damaged(&self) -> bool {
        self.damaged
    }

    /// Whether the scheduler should composite now
    pub fn needs_frame(&self) -> bool {
        self.damaged && !self.frame_pending
    }

    /// Claim the in-flight slot for a composite about to be issued
    pub fn begin_frame(&mut self) {
        debug_assert!(!self.frame_pending);
        self.frame_pending = true;
        self.damaged = false;
    }

    /// The previous present completed; the slot is free again
    pub fn frame_done(&mut self) {
        self.frame_pending = false;
    }

    pub fn frame_pending(&self) -> bool {
        self.frame_pending
    }
}

/// Table of all connected outputs
#[derive(Debug, Default)]
pub struct OutputManager {
    outputs: HashMap<OutputId, Output>,
    primary: Option<OutputId>,
}

impl OutputManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a detected output; the first becomes primary
    pub fn add(&mut self, output: Output) -> OutputId {
        let id = output.id;
        let is_first = self.outputs.is_empty();
        self.outputs.insert(id, output);
        if is_first {
            self.primary = Some(id);
        }
        id
    }

    pub fn get(&self, id: OutputId) -> Option<&Output> {
        self.outputs.get(&id)
    }

    pub fn get_mut(&mut self, id: OutputId) -> Option<&mut Output> {
        self.outputs.get_mut(&id)
    }

    /// Remove an output on hot-unplug
    ///
    /// The caller must re-home or unmap the surfaces it displayed before
    /// dropping the returned record; see
    /// [`CompositorState::remove_output`](crate::compositor::state::CompositorState::remove_output).
    pub fn remove(&mut self, id: OutputId) -> Option<Output> {
        let output = self.outputs.remove(&id);
        if self.primary == Some(id) {
            self.primary = self.outputs.keys().next().copied();
        }
        output
    }

    pub fn primary(&self) -> Option<OutputId> {
        self.primary
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutputId, &Output)> {
        self.outputs.iter()
    }

    pub fn ids(&self) -> Vec<OutputId> {
        self.outputs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headless_output() -> Output {
        let mut output = Output::new("headless-1".into(), "Nacre".into(), "Virtual".into());
        output.add_mode(OutputMode {
            width: 1920,
            height: 1080,
            refresh: 60_000,
            preferred: true,
        });
        output
    }

    #[test]
    fn test_first_mode_becomes_current() {
        let output = headless_output();
        assert_eq!(output.width(), 1920);
        assert_eq!(output.height(), 1080);
        assert_eq!(output.refresh_interval_ms(), 16);
    }

    #[test]
    fn test_frame_gating() {
        let mut output = headless_output();
        // Nothing changed: no frame needed
        assert!(!output.needs_frame());

        output.mark_damaged();
        assert!(output.needs_frame());

        output.begin_frame();
        // In flight: even new damage must wait for frame_done
        output.mark_damaged();
        assert!(!output.needs_frame());

        output.frame_done();
        assert!(output.needs_frame());
    }

    #[test]
    fn test_primary_moves_on_remove() {
        let mut manager = OutputManager::new();
        let a = manager.add(headless_output());
        let b = manager.add(headless_output());
        assert_eq!(manager.primary(), Some(a));

        manager.remove(a);
        assert_eq!(manager.primary(), Some(b));

        manager.remove(b);
        assert_eq!(manager.primary(), None);
    }
}
