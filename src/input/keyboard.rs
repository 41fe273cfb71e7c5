//! Keyboard devices and XKB state
//!
//! Modifier state is tracked once per seat through a shared XKB state
//! machine; each physical keyboard only records which keys it holds down and
//! mirrors the seat's logical LED state.

use bitflags::bitflags;
use log::debug;
use xkbcommon::xkb;

use crate::input::DeviceId;

/// Keyboard modifier state, serialized XKB masks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModifierState {
    /// Depressed modifiers (currently held down)
    pub depressed: u32,
    /// Latched modifiers (sticky, cleared on next key)
    pub latched: u32,
    /// Locked modifiers (toggled, like caps lock)
    pub locked: u32,
    /// Keyboard group/layout
    pub group: u32,
}

bitflags! {
    /// Keyboard LEDs mirrored onto every attached device
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Leds: u32 {
        const CAPS_LOCK   = 1 << 0;
        const NUM_LOCK    = 1 << 1;
        const SCROLL_LOCK = 1 << 2;
    }
}

/// One physical keyboard attached to the seat
#[derive(Debug)]
pub struct KeyboardDevice {
    pub id: DeviceId,
    pub name: String,
    /// Keys this device currently holds down (evdev keycodes)
    pressed_keys: Vec<u32>,
    /// Mirrored logical LED state
    leds: Leds,
    /// Repeat rate (characters per second)
    repeat_rate: u32,
    /// Repeat delay (milliseconds)
    repeat_delay: u32,
}

impl KeyboardDevice {
    pub fn new(name: String) -> Self {
        Self {
            id: DeviceId::new(),
            name,
            pressed_keys: Vec::new(),
            leds: Leds::empty(),
            repeat_rate: 25,
            repeat_delay: 600,
        }
    }

    /// Handle a key press; false means the key was already down (repeat)
    pub fn key_press(&mut self, keycode: u32) -> bool {
        if !self.pressed_keys.contains(&keycode) {
            self.pressed_keys.push(keycode);
            true
        } else {
            false
        }
    }

    /// Handle a key release; false means the key was not down
    pub fn key_release(&mut self, keycode: u32) -> bool {
        if let Some(idx) = self.pressed_keys.iter().position(|&k| k == keycode) {
            self.pressed_keys.remove(idx);
            true
        } else {
            false
        }
    }

    pub fn pressed_keys(&self) -> &[u32] {
        &self.pressed_keys
    }

    /// Mirror the seat's logical LED state onto this device
    pub fn set_leds(&mut self, leds: Leds) {
        if self.leds != leds {
            debug!("Keyboard {:?} LEDs -> {:?}", self.id, leds);
            self.leds = leds;
        }
    }

    pub fn leds(&self) -> Leds {
        self.leds
    }

    pub fn set_repeat_info(&mut self, rate: u32, delay: u32) {
        self.repeat_rate = rate;
        self.repeat_delay = delay;
    }

    pub fn repeat_info(&self) -> (u32, u32) {
        (self.repeat_rate, self.repeat_delay)
    }
}

/// Seat-shared XKB keymap and state
///
/// Fed keycodes from every attached keyboard so modifier and LED state stay
/// consistent across devices.
pub struct XkbKeyboard {
    keymap: xkb::Keymap,
    state: xkb::State,
}

impl XkbKeyboard {
    /// Compile a keymap from RMLVO names; empty strings pick XKB defaults
    pub fn new_from_names(layout: &str) -> Option<Self> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = xkb::Keymap::new_from_names(
            &context,
            "",
            "",
            layout,
            "",
            None,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )?;
        let state = xkb::State::new(&keymap);
        Some(Self { keymap, state })
    }

    /// Keymap text handed to clients via wl_keyboard.keymap
    pub fn keymap_string(&self) -> String {
        self.keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1)
    }

    /// Feed one key event; returns the resulting modifier and LED state
    ///
    /// Keycodes are evdev codes; XKB keycodes are offset by 8.
    pub fn handle_key(&mut self, keycode: u32, pressed: bool) -> (ModifierState, Leds) {
        let direction = if pressed {
            xkb::KeyDirection::Down
        } else {
            xkb::KeyDirection::Up
        };
        self.state.update_key((keycode + 8).into(), direction);
        (self.modifiers(), self.leds())
    }

    pub fn modifiers(&self) -> ModifierState {
        ModifierState {
            depressed: self.state.serialize_mods(xkb::STATE_MODS_DEPRESSED),
            latched: self.state.serialize_mods(xkb::STATE_MODS_LATCHED),
            locked: self.state.serialize_mods(xkb::STATE_MODS_LOCKED),
            group: self.state.serialize_layout(xkb::STATE_LAYOUT_EFFECTIVE),
        }
    }

    pub fn leds(&self) -> Leds {
        let mut leds = Leds::empty();
        if self.state.led_name_is_active(xkb::LED_NAME_CAPS) {
            leds |= Leds::CAPS_LOCK;
        }
        if self.state.led_name_is_active(xkb::LED_NAME_NUM) {
            leds |= Leds::NUM_LOCK;
        }
        if self.state.led_name_is_active(xkb::LED_NAME_SCROLL) {
            leds |= Leds::SCROLL_LOCK;
        }
        leds
    }
}

impl std::fmt::Debug for XkbKeyboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XkbKeyboard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // evdev keycodes
    const KEY_A: u32 = 30;
    const KEY_CAPSLOCK: u32 = 58;

    #[test]
    fn test_key_press_release() {
        let mut keyboard = KeyboardDevice::new("kbd0".into());

        assert!(keyboard.key_press(KEY_A));
        assert!(keyboard.pressed_keys().contains(&KEY_A));

        // Same key again is a repeat
        assert!(!keyboard.key_press(KEY_A));

        assert!(keyboard.key_release(KEY_A));
        assert!(!keyboard.pressed_keys().contains(&KEY_A));
        assert!(!keyboard.key_release(KEY_A));
    }

    #[test]
    fn test_led_mirroring() {
        let mut keyboard = KeyboardDevice::new("kbd0".into());
        assert_eq!(keyboard.leds(), Leds::empty());
        keyboard.set_leds(Leds::CAPS_LOCK | Leds::NUM_LOCK);
        assert!(keyboard.leds().contains(Leds::CAPS_LOCK));
    }

    #[test]
    fn test_repeat_info() {
        let mut keyboard = KeyboardDevice::new("kbd0".into());
        keyboard.set_repeat_info(30, 500);
        assert_eq!(keyboard.repeat_info(), (30, 500));
    }

    #[test]
    fn test_xkb_caps_lock_drives_led() {
        let Some(mut xkb) = XkbKeyboard::new_from_names("us") else {
            // No compiled keymaps on this host; nothing to assert against
            return;
        };
        assert!(!xkb.keymap_string().is_empty());

        xkb.handle_key(KEY_CAPSLOCK, true);
        let (mods, leds) = xkb.handle_key(KEY_CAPSLOCK, false);
        assert!(leds.contains(Leds::CAPS_LOCK));
        assert_ne!(mods.locked, 0);
    }
}
