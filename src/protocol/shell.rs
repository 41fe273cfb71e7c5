//! xdg-shell positioner arithmetic
//!
//! Role assignment, configure/ack serials, and commit validation live in the
//! compositor core; this module owns the placement math that turns a
//! client-supplied positioner into popup geometry relative to its parent.

use crate::compositor::geometry::Rect;

/// Anchor edge on the anchor rectangle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Anchor {
    #[default]
    None,
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    BottomLeft,
    TopRight,
    BottomRight,
}

impl Anchor {
    /// Convert from the xdg_positioner wire value
    pub fn from_wayland(value: u32) -> Self {
        match value {
            1 => Anchor::Top,
            2 => Anchor::Bottom,
            3 => Anchor::Left,
            4 => Anchor::Right,
            5 => Anchor::TopLeft,
            6 => Anchor::BottomLeft,
            7 => Anchor::TopRight,
            8 => Anchor::BottomRight,
            _ => Anchor::None,
        }
    }
}

/// Direction the popup extends from the anchor point
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Gravity {
    #[default]
    None,
    Top,
    Bottom,
    Left,
    Right,
    TopLeft,
    BottomLeft,
    TopRight,
    BottomRight,
}

impl Gravity {
    /// Convert from the xdg_positioner wire value
    pub fn from_wayland(value: u32) -> Self {
        match value {
            1 => Gravity::Top,
            2 => Gravity::Bottom,
            3 => Gravity::Left,
            4 => Gravity::Right,
            5 => Gravity::TopLeft,
            6 => Gravity::BottomLeft,
            7 => Gravity::TopRight,
            8 => Gravity::BottomRight,
            _ => Gravity::None,
        }
    }
}

/// Popup placement rules accumulated from client requests
#[derive(Debug, Default, Clone)]
pub struct Positioner {
    /// Size of the popup
    pub size: (i32, i32),
    /// Anchor rectangle in parent surface coordinates
    pub anchor_rect: Rect,
    pub anchor: Anchor,
    pub gravity: Gravity,
    pub constraint_adjustment: u32,
    /// Offset from the computed position
    pub offset: (i32, i32),
}

impl Positioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_size(&mut self, width: i32, height: i32) {
        self.size = (width, height);
    }

    pub fn set_anchor_rect(&mut self, x: i32, y: i32, width: i32, height: i32) {
        self.anchor_rect = Rect::new(x, y, width.max(0) as u32, height.max(0) as u32);
    }

    pub fn set_anchor(&mut self, anchor: Anchor) {
        self.anchor = anchor;
    }

    pub fn set_gravity(&mut self, gravity: Gravity) {
        self.gravity = gravity;
    }

    pub fn set_constraint_adjustment(&mut self, adjustment: u32) {
        self.constraint_adjustment = adjustment;
    }

    pub fn set_offset(&mut self, x: i32, y: i32) {
        self.offset = (x, y);
    }

    /// Compute the popup geometry relative to the parent surface
    pub fn geometry(&self) -> Rect {
        let Rect {
            x: ax,
            y: ay,
            width,
            height,
        } = self.anchor_rect;
        let (aw, ah) = (width as i32, height as i32);

        // Anchor point on the anchor rectangle
        let (anchor_x, anchor_y) = match self.anchor {
            Anchor::None => (ax + aw / 2, ay + ah / 2),
            Anchor::Top => (ax + aw / 2, ay),
            Anchor::Bottom => (ax + aw / 2, ay + ah),
            Anchor::Left => (ax, ay + ah / 2),
            Anchor::Right => (ax + aw, ay + ah / 2),
            Anchor::TopLeft => (ax, ay),
            Anchor::TopRight => (ax + aw, ay),
            Anchor::BottomLeft => (ax, ay + ah),
            Anchor::BottomRight => (ax + aw, ay + ah),
        };

        // Gravity decides which way the popup grows from the anchor point
        let (popup_w, popup_h) = self.size;
        let (mut x, mut y) = match self.gravity {
            Gravity::None => (anchor_x - popup_w / 2, anchor_y - popup_h / 2),
            Gravity::Top => (anchor_x - popup_w / 2, anchor_y - popup_h),
            Gravity::Bottom => (anchor_x - popup_w / 2, anchor_y),
            Gravity::Left => (anchor_x - popup_w, anchor_y - popup_h / 2),
            Gravity::Right => (anchor_x, anchor_y - popup_h / 2),
            Gravity::TopLeft => (anchor_x - popup_w, anchor_y - popup_h),
            Gravity::TopRight => (anchor_x, anchor_y - popup_h),
            Gravity::BottomLeft => (anchor_x - popup_w, anchor_y),
            Gravity::BottomRight => (anchor_x, anchor_y),
        };

        x += self.offset.0;
        y += self.offset.1;

        Rect::new(x, y, popup_w.max(0) as u32, popup_h.max(0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bottom_right_placement() {
        let mut positioner = Positioner::new();
        positioner.set_size(200, 100);
        positioner.set_anchor_rect(0, 0, 100, 50);
        positioner.set_anchor(Anchor::BottomRight);
        positioner.set_gravity(Gravity::BottomRight);

        let geometry = positioner.geometry();
        assert_eq!(geometry, Rect::new(100, 50, 200, 100));
    }

    #[test]
    fn test_centered_placement() {
        let mut positioner = Positioner::new();
        positioner.set_size(50, 50);
        positioner.set_anchor_rect(0, 0, 100, 100);

        // Default anchor and gravity center the popup on the rect
        let geometry = positioner.geometry();
        assert_eq!(geometry, Rect::new(25, 25, 50, 50));
    }

    #[test]
    fn test_offset_applies_last() {
        let mut positioner = Positioner::new();
        positioner.set_size(10, 10);
        positioner.set_anchor_rect(0, 0, 20, 20);
        positioner.set_anchor(Anchor::TopLeft);
        positioner.set_gravity(Gravity::BottomRight);
        positioner.set_offset(5, -5);

        let geometry = positioner.geometry();
        assert_eq!((geometry.x, geometry.y), (5, -5));
    }

    #[test]
    fn test_wire_conversions() {
        assert_eq!(Anchor::from_wayland(1), Anchor::Top);
        assert_eq!(Anchor::from_wayland(8), Anchor::BottomRight);
        assert_eq!(Anchor::from_wayland(99), Anchor::None);
        assert_eq!(Gravity::from_wayland(2), Gravity::Bottom);
    }
}
