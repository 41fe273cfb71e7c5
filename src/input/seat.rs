//! Seat: one logical group of input devices and their focus targets
//!
//! The seat converts raw device events into focus-addressed events delivered
//! to exactly one surface: keyboard events go to the explicit keyboard
//! focus, pointer events to the surface under the cursor (recomputed on
//! every motion by hit testing current scene state).
//!
//! Modifier state is shared across all attached keyboards; LED state derived
//! from it is pushed back to every device so physical LEDs mirror logical
//! state. A device that disappears mid-gesture releases whatever focus or
//! grab it held; nothing ever blocks on a device.

use log::debug;

use crate::compositor::scene::Scene;
use crate::compositor::surface::{SurfaceId, SurfaceManager};
use crate::input::keyboard::{KeyboardDevice, Leds, ModifierState, XkbKeyboard};
use crate::input::pointer::{GrabType, Pointer};
use crate::input::DeviceId;

/// Seat capabilities advertised to clients
#[derive(Debug, Clone, Copy, Default)]
pub struct SeatCapabilities {
    pub keyboard: bool,
    pub pointer: bool,
    pub touch: bool,
}

impl SeatCapabilities {
    /// Convert to wl_seat capability flags
    pub fn to_wayland(&self) -> u32 {
        let mut flags = 0u32;
        if self.pointer {
            flags |= 1;
        }
        if self.keyboard {
            flags |= 2;
        }
        if self.touch {
            flags |= 4;
        }
        flags
    }
}

/// Key state on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Released = 0,
    Pressed = 1,
}

/// Button state on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Released = 0,
    Pressed = 1,
}

/// Scroll axis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisType {
    VerticalScroll = 0,
    HorizontalScroll = 1,
}

/// Keyboard events addressed to the seat's keyboard focus
#[derive(Debug, Clone, PartialEq)]
pub enum KeyboardEvent {
    /// Keyboard focus entered a surface
    Enter {
        surface: SurfaceId,
        pressed_keys: Vec<u32>,
    },
    /// Keyboard focus left a surface
    Leave { surface: SurfaceId },
    /// Key press or release
    Key { time: u32, key: u32, state: KeyState },
    /// Modifier state changed
    Modifiers(ModifierState),
}

/// Pointer events addressed to the seat's pointer focus
#[derive(Debug, Clone, PartialEq)]
pub enum PointerEvent {
    /// Pointer entered a surface at surface-local coordinates
    Enter { surface: SurfaceId, x: f64, y: f64 },
    /// Pointer left a surface
    Leave { surface: SurfaceId },
    /// Motion at surface-local coordinates
    Motion { time: u32, x: f64, y: f64 },
    /// Button press or release
    Button {
        time: u32,
        button: u32,
        state: ButtonState,
    },
    /// Axis (scroll) event
    Axis { time: u32, axis: AxisType, value: f64 },
    /// Event-group delimiter
    Frame,
}

/// Input seat coordinating keyboards and pointers
pub struct Seat {
    name: String,
    keyboards: Vec<KeyboardDevice>,
    pointer_devices: Vec<DeviceId>,
    pointer: Pointer,
    keyboard_focus: Option<SurfaceId>,
    /// Shared modifier state, updated by every keyboard
    modifiers: ModifierState,
    /// Logical LED state fanned out to every keyboard
    leds: Leds,
    /// Seat-wide XKB keymap/state; optional so virtual seats work without
    /// compiled keymaps
    xkb: Option<XkbKeyboard>,
}

impl Seat {
    pub fn new() -> Self {
        Self::with_name("seat0".to_string())
    }

    pub fn with_name(name: String) -> Self {
        Self {
            name,
            keyboards: Vec::new(),
            pointer_devices: Vec::new(),
            pointer: Pointer::new(),
            keyboard_focus: None,
            modifiers: ModifierState::default(),
            leds: Leds::empty(),
            xkb: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> SeatCapabilities {
        SeatCapabilities {
            keyboard: !self.keyboards.is_empty(),
            pointer: !self.pointer_devices.is_empty(),
            touch: false,
        }
    }

    /// Compile and install the seat keymap
    pub fn load_keymap(&mut self, layout: &str) -> bool {
        match XkbKeyboard::new_from_names(layout) {
            Some(xkb) => {
                self.xkb = Some(xkb);
                true
            }
            None => false,
        }
    }

    /// Keymap text for wl_keyboard.keymap, if a keymap is loaded
    pub fn keymap_string(&self) -> Option<String> {
        self.xkb.as_ref().map(|x| x.keymap_string())
    }

    pub fn modifiers(&self) -> ModifierState {
        self.modifiers
    }

    pub fn leds(&self) -> Leds {
        self.leds
    }

    /// Attach a keyboard; it immediately mirrors the seat's LED state
    pub fn attach_keyboard(&mut self, name: String) -> DeviceId {
        let mut device = KeyboardDevice::new(name);
        device.set_leds(self.leds);
        let id = device.id;
        self.keyboards.push(device);
        debug!("Keyboard {:?} attached to seat {}", id, self.name);
        id
    }

    /// Attach a pointer device (stateless event source)
    pub fn attach_pointer(&mut self) -> DeviceId {
        let id = DeviceId::new();
        self.pointer_devices.push(id);
        debug!("Pointer {:?} attached to seat {}", id, self.name);
        id
    }

    pub fn keyboard(&self, id: DeviceId) -> Option<&KeyboardDevice> {
        self.keyboards.iter().find(|k| k.id == id)
    }

    pub fn keyboards(&self) -> &[KeyboardDevice] {
        &self.keyboards
    }

    pub fn pointer(&self) -> &Pointer {
        &self.pointer
    }

    pub fn pointer_mut(&mut self) -> &mut Pointer {
        &mut self.pointer
    }

    /// Detach a device that disappeared; releases focus/grabs it held
    pub fn remove_device(&mut self, id: DeviceId) -> Vec<PointerEvent> {
        let mut events = Vec::new();

        if let Some(pos) = self.keyboards.iter().position(|k| k.id == id) {
            self.keyboards.remove(pos);
            debug!("Keyboard {:?} removed", id);
            return events;
        }

        if let Some(pos) = self.pointer_devices.iter().position(|d| *d == id) {
            self.pointer_devices.remove(pos);
            self.pointer.release_device(id);
            if self.pointer_devices.is_empty() {
                // Last pointer gone: drop held buttons and focus mid-gesture
                self.pointer.end_grab();
                self.pointer.clear_buttons();
                if let Some(old) = self.pointer.set_focus(None, 0.0, 0.0) {
                    events.push(PointerEvent::Leave { surface: old });
                    events.push(PointerEvent::Frame);
                }
            }
            debug!("Pointer {:?} removed", id);
        }
        events
    }

    /// Update shared modifier state and fan LED state out to every keyboard
    pub fn apply_modifiers(&mut self, modifiers: ModifierState, leds: Leds) -> Vec<KeyboardEvent> {
        let mut events = Vec::new();
        if modifiers != self.modifiers {
            self.modifiers = modifiers;
            events.push(KeyboardEvent::Modifiers(modifiers));
        }
        if leds != self.leds {
            self.leds = leds;
            for keyboard in &mut self.keyboards {
                keyboard.set_leds(leds);
            }
        }
        events
    }

    /// Handle a raw key event from one keyboard device
    pub fn handle_key(
        &mut self,
        device: DeviceId,
        keycode: u32,
        pressed: bool,
        time: u32,
    ) -> Vec<KeyboardEvent> {
        let Some(keyboard) = self.keyboards.iter_mut().find(|k| k.id == device) else {
            return Vec::new();
        };
        let changed = if pressed {
            keyboard.key_press(keycode)
        } else {
            keyboard.key_release(keycode)
        };
        if !changed {
            return Vec::new();
        }

        let mut events = Vec::new();
        if let Some(xkb) = self.xkb.as_mut() {
            let (modifiers, leds) = xkb.handle_key(keycode, pressed);
            events.extend(self.apply_modifiers(modifiers, leds));
        }

        if self.keyboard_focus.is_some() {
            events.push(KeyboardEvent::Key {
                time,
                key: keycode,
                state: if pressed {
                    KeyState::Pressed
                } else {
                    KeyState::Released
                },
            });
        }
        events
    }

    /// Explicitly move keyboard focus
    pub fn set_keyboard_focus(&mut self, surface: Option<SurfaceId>) -> Vec<KeyboardEvent> {
        if surface == self.keyboard_focus {
            return Vec::new();
        }
        let mut events = Vec::new();
        if let Some(old) = self.keyboard_focus {
            events.push(KeyboardEvent::Leave { surface: old });
        }
        self.keyboard_focus = surface;
        if let Some(new) = surface {
            let pressed: Vec<u32> = self
                .keyboards
                .iter()
                .flat_map(|k| k.pressed_keys().iter().copied())
                .collect();
            events.push(KeyboardEvent::Enter {
                surface: new,
                pressed_keys: pressed,
            });
            events.push(KeyboardEvent::Modifiers(self.modifiers));
        }
        debug!("Keyboard focus -> {:?}", surface);
        events
    }

    pub fn keyboard_focus(&self) -> Option<SurfaceId> {
        self.keyboard_focus
    }

    pub fn pointer_focus(&self) -> Option<SurfaceId> {
        self.pointer.focus()
    }

    /// Handle pointer motion in global coordinates
    ///
    /// Recomputes pointer focus by hit testing the scene's current state; a
    /// grab pins focus to the grab surface for as long as it stays mapped.
    pub fn handle_pointer_motion(
        &mut self,
        time: u32,
        x: f64,
        y: f64,
        scene: &Scene,
        surfaces: &SurfaceManager,
    ) -> Vec<PointerEvent> {
        self.pointer.motion(x, y);

        // A grab on a surface that got unmapped no longer pins focus
        if let Some(grab_surface) = self.pointer.grab().map(|g| g.surface) {
            if !scene.contains(grab_surface) {
                self.pointer.end_grab();
            }
        }

        let target = if let Some(grab_surface) = self.pointer.grab().map(|g| g.surface) {
            scene.element(grab_surface).map(|e| {
                (
                    grab_surface,
                    x - e.position.0 as f64,
                    y - e.position.1 as f64,
                )
            })
        } else {
            scene.hit_test(x, y, surfaces)
        };

        let mut events = Vec::new();
        match target {
            Some((surface, local_x, local_y)) => {
                if self.pointer.focus() == Some(surface) {
                    self.pointer.set_local_position(local_x, local_y);
                    events.push(PointerEvent::Motion {
                        time,
                        x: local_x,
                        y: local_y,
                    });
                } else {
                    if let Some(old) = self.pointer.set_focus(Some(surface), local_x, local_y) {
                        events.push(PointerEvent::Leave { surface: old });
                    }
                    events.push(PointerEvent::Enter {
                        surface,
                        x: local_x,
                        y: local_y,
                    });
                }
                events.push(PointerEvent::Frame);
            }
            None => {
                if let Some(old) = self.pointer.set_focus(None, 0.0, 0.0) {
                    events.push(PointerEvent::Leave { surface: old });
                    events.push(PointerEvent::Frame);
                }
            }
        }
        events
    }

    /// Handle a button event; returns the events plus the surface a press
    /// landed on (for click-to-focus policy upstream)
    pub fn handle_pointer_button(
        &mut self,
        device: Option<DeviceId>,
        time: u32,
        button: u32,
        pressed: bool,
    ) -> (Vec<PointerEvent>, Option<SurfaceId>) {
        let changed = if pressed {
            self.pointer.button_press(button)
        } else {
            self.pointer.button_release(button)
        };
        if !changed {
            return (Vec::new(), None);
        }

        let focus = self.pointer.focus();
        let mut events = Vec::new();
        if focus.is_some() {
            events.push(PointerEvent::Button {
                time,
                button,
                state: if pressed {
                    ButtonState::Pressed
                } else {
                    ButtonState::Released
                },
            });
            events.push(PointerEvent::Frame);
        }

        if pressed {
            // Implicit grab for the duration of the press
            if let Some(surface) = focus {
                if !self.pointer.has_grab() {
                    self.pointer.start_grab(surface, device, 0, GrabType::Button);
                }
            }
            (events, focus)
        } else {
            if !self.pointer.has_button_pressed()
                && self.pointer.grab().map(|g| g.grab_type) == Some(GrabType::Button)
            {
                self.pointer.end_grab();
            }
            (events, None)
        }
    }

    /// Handle a scroll event
    pub fn handle_pointer_axis(&mut self, time: u32, axis: AxisType, value: f64) -> Vec<PointerEvent> {
        if self.pointer.focus().is_none() {
            return Vec::new();
        }
        vec![PointerEvent::Axis { time, axis, value }, PointerEvent::Frame]
    }
}

impl Default for Seat {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::buffer::BufferId;
    use crate::compositor::output::OutputId;

    const KEY_A: u32 = 30;
    const BTN_LEFT: u32 = 0x110;

    fn mapped_surface(surfaces: &mut SurfaceManager, size: (u32, u32)) -> SurfaceId {
        let id = surfaces.create(None);
        let surface = surfaces.get_mut(id).unwrap();
        surface.attach(Some(BufferId(id.0)), 0, 0);
        surface.apply_pending(Some(size));
        id
    }

    #[test]
    fn test_capabilities_follow_devices() {
        let mut seat = Seat::new();
        assert_eq!(seat.capabilities().to_wayland(), 0);
        seat.attach_keyboard("kbd0".into());
        seat.attach_pointer();
        assert_eq!(seat.capabilities().to_wayland(), 3);
    }

    #[test]
    fn test_modifier_fan_out_to_all_keyboards() {
        let mut seat = Seat::new();
        let _k1 = seat.attach_keyboard("kbd0".into());
        let _k2 = seat.attach_keyboard("kbd1".into());

        let mods = ModifierState {
            depressed: 0,
            latched: 0,
            locked: 2,
            group: 0,
        };
        let events = seat.apply_modifiers(mods, Leds::CAPS_LOCK);
        assert_eq!(events, vec![KeyboardEvent::Modifiers(mods)]);

        // Every attached keyboard mirrors the LED, not just the one that
        // produced the event
        for keyboard in seat.keyboards() {
            assert!(keyboard.leds().contains(Leds::CAPS_LOCK));
        }
    }

    #[test]
    fn test_late_attached_keyboard_mirrors_leds() {
        let mut seat = Seat::new();
        seat.attach_keyboard("kbd0".into());
        seat.apply_modifiers(ModifierState::default(), Leds::NUM_LOCK);

        let late = seat.attach_keyboard("kbd1".into());
        assert!(seat.keyboard(late).unwrap().leds().contains(Leds::NUM_LOCK));
    }

    #[test]
    fn test_key_events_require_focus() {
        let mut seat = Seat::new();
        let kbd = seat.attach_keyboard("kbd0".into());

        // No focus: the key is tracked but no Key event is addressed
        let events = seat.handle_key(kbd, KEY_A, true, 1);
        assert!(events.iter().all(|e| !matches!(e, KeyboardEvent::Key { .. })));
        seat.handle_key(kbd, KEY_A, false, 2);

        let surface = SurfaceId(1);
        seat.set_keyboard_focus(Some(surface));
        let events = seat.handle_key(kbd, KEY_A, true, 3);
        assert!(events
            .iter()
            .any(|e| matches!(e, KeyboardEvent::Key { key, state: KeyState::Pressed, .. } if *key == KEY_A)));
    }

    #[test]
    fn test_focus_enter_carries_pressed_keys() {
        let mut seat = Seat::new();
        let kbd = seat.attach_keyboard("kbd0".into());
        let surface = SurfaceId(1);

        seat.set_keyboard_focus(Some(surface));
        seat.handle_key(kbd, KEY_A, true, 1);

        let other = SurfaceId(2);
        let events = seat.set_keyboard_focus(Some(other));
        assert_eq!(events[0], KeyboardEvent::Leave { surface });
        match &events[1] {
            KeyboardEvent::Enter {
                surface: s,
                pressed_keys,
            } => {
                assert_eq!(*s, other);
                assert_eq!(pressed_keys, &vec![KEY_A]);
            }
            other => panic!("expected Enter, got {:?}", other),
        }
    }

    #[test]
    fn test_pointer_motion_recomputes_focus() {
        let mut surfaces = SurfaceManager::new();
        let mut scene = Scene::new();
        let output = OutputId(1);

        let a = mapped_surface(&mut surfaces, (100, 100));
        let b = mapped_surface(&mut surfaces, (100, 100));
        scene.insert(a, output, (0, 0));
        scene.insert(b, output, (200, 0));

        let mut seat = Seat::new();
        seat.attach_pointer();

        let events = seat.handle_pointer_motion(1, 50.0, 50.0, &scene, &surfaces);
        assert!(matches!(events[0], PointerEvent::Enter { surface, .. } if surface == a));

        let events = seat.handle_pointer_motion(2, 60.0, 50.0, &scene, &surfaces);
        assert!(matches!(events[0], PointerEvent::Motion { x, y, .. } if x == 60.0 && y == 50.0));

        let events = seat.handle_pointer_motion(3, 250.0, 50.0, &scene, &surfaces);
        assert_eq!(events[0], PointerEvent::Leave { surface: a });
        assert!(matches!(events[1], PointerEvent::Enter { surface, .. } if surface == b));

        // Off every surface
        let events = seat.handle_pointer_motion(4, 400.0, 400.0, &scene, &surfaces);
        assert_eq!(events[0], PointerEvent::Leave { surface: b });
        assert_eq!(seat.pointer_focus(), None);
    }

    #[test]
    fn test_button_grab_pins_focus() {
        let mut surfaces = SurfaceManager::new();
        let mut scene = Scene::new();
        let output = OutputId(1);

        let a = mapped_surface(&mut surfaces, (100, 100));
        let b = mapped_surface(&mut surfaces, (100, 100));
        scene.insert(a, output, (0, 0));
        scene.insert(b, output, (200, 0));

        let mut seat = Seat::new();
        let dev = seat.attach_pointer();

        seat.handle_pointer_motion(1, 50.0, 50.0, &scene, &surfaces);
        let (_, hit) = seat.handle_pointer_button(Some(dev), 2, BTN_LEFT, true);
        assert_eq!(hit, Some(a));

        // While the button is held, motion over b still reports a
        let events = seat.handle_pointer_motion(3, 250.0, 50.0, &scene, &surfaces);
        assert!(matches!(events[0], PointerEvent::Motion { x, .. } if x == 250.0));
        assert_eq!(seat.pointer_focus(), Some(a));

        // Release: the grab ends and focus follows the cursor again
        seat.handle_pointer_button(Some(dev), 4, BTN_LEFT, false);
        let events = seat.handle_pointer_motion(5, 250.0, 50.0, &scene, &surfaces);
        assert_eq!(events[0], PointerEvent::Leave { surface: a });
        assert!(matches!(events[1], PointerEvent::Enter { surface, .. } if surface == b));
    }

    #[test]
    fn test_device_loss_releases_grab_and_focus() {
        let mut surfaces = SurfaceManager::new();
        let mut scene = Scene::new();
        let a = mapped_surface(&mut surfaces, (100, 100));
        scene.insert(a, OutputId(1), (0, 0));

        let mut seat = Seat::new();
        let dev = seat.attach_pointer();
        seat.handle_pointer_motion(1, 10.0, 10.0, &scene, &surfaces);
        seat.handle_pointer_button(Some(dev), 2, BTN_LEFT, true);
        assert!(seat.pointer().has_grab());

        let events = seat.remove_device(dev);
        assert!(!seat.pointer().has_grab());
        assert!(!seat.pointer().has_button_pressed());
        assert_eq!(events[0], PointerEvent::Leave { surface: a });
        assert_eq!(seat.pointer_focus(), None);
    }

    #[test]
    fn test_axis_requires_focus() {
        let mut seat = Seat::new();
        seat.attach_pointer();
        assert!(seat
            .handle_pointer_axis(1, AxisType::VerticalScroll, 10.0)
            .is_empty());
    }
}
