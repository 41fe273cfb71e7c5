//! Pointer (mouse/trackpad) state
//!
//! Pointer devices themselves are stateless event sources; this module keeps
//! the seat-level pointer state they feed: focus, position, held buttons,
//! the cursor surface, and grabs.

use crate::compositor::surface::SurfaceId;
use crate::input::DeviceId;

/// Pointer state shared by all pointer devices on a seat
#[derive(Debug, Default)]
pub struct Pointer {
    /// Currently focused surface
    focus: Option<SurfaceId>,
    /// Position in global coordinates
    position: (f64, f64),
    /// Position within the focused surface
    local_position: (f64, f64),
    /// Currently pressed buttons
    pressed_buttons: Vec<u32>,
    /// Cursor surface chosen by the focused client
    cursor_surface: Option<SurfaceId>,
    cursor_hotspot: (i32, i32),
    grab: Option<PointerGrab>,
}

/// An active pointer grab
#[derive(Debug, Clone, Copy)]
pub struct PointerGrab {
    /// Surface that holds the grab
    pub surface: SurfaceId,
    /// Device that initiated the grab, if any
    pub device: Option<DeviceId>,
    /// Input serial that initiated the grab
    pub serial: u32,
    pub grab_type: GrabType,
}

/// Type of pointer grab
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabType {
    /// Implicit grab while a button is held
    Button,
    /// Popup keeps the pointer until dismissed
    Popup,
    /// Interactive move
    Move,
    /// Interactive resize from an edge
    Resize(ResizeEdge),
}

/// Resize edge for resize grabs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeEdge {
    None,
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Pointer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move focus to a surface at the given surface-local position
    pub fn set_focus(&mut self, surface: Option<SurfaceId>, x: f64, y: f64) -> Option<SurfaceId> {
        let old = self.focus;
        self.focus = surface;
        self.local_position = (x, y);
        old
    }

    pub fn focus(&self) -> Option<SurfaceId> {
        self.focus
    }

    /// Record global pointer position
    pub fn motion(&mut self, x: f64, y: f64) {
        self.position = (x, y);
    }

    pub fn position(&self) -> (f64, f64) {
        self.position
    }

    pub fn local_position(&self) -> (f64, f64) {
        self.local_position
    }

    pub fn set_local_position(&mut self, x: f64, y: f64) {
        self.local_position = (x, y);
    }

    /// Handle a button press; false if the button was already down
    pub fn button_press(&mut self, button: u32) -> bool {
        if !self.pressed_buttons.contains(&button) {
            self.pressed_buttons.push(button);
            true
        } else {
            false
        }
    }

    /// Handle a button release; false if the button was not down
    pub fn button_release(&mut self, button: u32) -> bool {
        if let Some(idx) = self.pressed_buttons.iter().position(|&b| b == button) {
            self.pressed_buttons.remove(idx);
            true
        } else {
            false
        }
    }

    pub fn pressed_buttons(&self) -> &[u32] {
        &self.pressed_buttons
    }

    pub fn has_button_pressed(&self) -> bool {
        !self.pressed_buttons.is_empty()
    }

    /// Drop all held buttons (device loss); returns what was held
    pub fn clear_buttons(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.pressed_buttons)
    }

    /// Set the cursor surface and hotspot for the focused client
    pub fn set_cursor(&mut self, surface: Option<SurfaceId>, hotspot_x: i32, hotspot_y: i32) {
        self.cursor_surface = surface;
        self.cursor_hotspot = (hotspot_x, hotspot_y);
    }

    pub fn cursor(&self) -> Option<SurfaceId> {
        self.cursor_surface
    }

    pub fn cursor_hotspot(&self) -> (i32, i32) {
        self.cursor_hotspot
    }

    pub fn start_grab(
        &mut self,
        surface: SurfaceId,
        device: Option<DeviceId>,
        serial: u32,
        grab_type: GrabType,
    ) {
        self.grab = Some(PointerGrab {
            surface,
            device,
            serial,
            grab_type,
        });
    }

    pub fn end_grab(&mut self) {
        self.grab = None;
    }

    pub fn grab(&self) -> Option<&PointerGrab> {
        self.grab.as_ref()
    }

    pub fn has_grab(&self) -> bool {
        self.grab.is_some()
    }

    /// Release a grab held through a device that disappeared
    pub fn release_device(&mut self, device: DeviceId) -> bool {
        if self.grab.map(|g| g.device == Some(device)).unwrap_or(false) {
            self.grab = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BTN_LEFT: u32 = 0x110;

    #[test]
    fn test_button_press_release() {
        let mut pointer = Pointer::new();

        assert!(pointer.button_press(BTN_LEFT));
        assert!(pointer.has_button_pressed());
        assert!(!pointer.button_press(BTN_LEFT));

        assert!(pointer.button_release(BTN_LEFT));
        assert!(!pointer.has_button_pressed());
    }

    #[test]
    fn test_focus_change_returns_old() {
        let mut pointer = Pointer::new();
        let a = SurfaceId(1);
        let b = SurfaceId(2);

        assert_eq!(pointer.set_focus(Some(a), 5.0, 5.0), None);
        assert_eq!(pointer.set_focus(Some(b), 1.0, 1.0), Some(a));
        assert_eq!(pointer.focus(), Some(b));
    }

    #[test]
    fn test_cursor() {
        let mut pointer = Pointer::new();
        let cursor = SurfaceId(100);
        pointer.set_cursor(Some(cursor), 10, 5);
        assert_eq!(pointer.cursor(), Some(cursor));
        assert_eq!(pointer.cursor_hotspot(), (10, 5));
    }

    #[test]
    fn test_grab_released_on_device_loss() {
        let mut pointer = Pointer::new();
        let device = DeviceId(9);
        pointer.start_grab(SurfaceId(1), Some(device), 1, GrabType::Button);
        assert!(pointer.has_grab());

        // Unrelated device: grab stays
        assert!(!pointer.release_device(DeviceId(10)));
        assert!(pointer.has_grab());

        assert!(pointer.release_device(device));
        assert!(!pointer.has_grab());
    }
}
