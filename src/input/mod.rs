//! Input handling module
//!
//! Keyboard/pointer device state and the seat that routes their events to
//! focused surfaces.

pub mod keyboard;
pub mod pointer;
pub mod seat;

pub use keyboard::{KeyboardDevice, Leds, ModifierState, XkbKeyboard};
pub use pointer::Pointer;
pub use seat::Seat;

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for physical input devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

impl DeviceId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        DeviceId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}
