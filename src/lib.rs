//! Nacre - an event-driven window server core
//!
//! Nacre tracks per-application window records, negotiates buffer commits
//! from clients over an xdg-shell-shaped protocol, routes input through one
//! seat, and paces compositing to each output's frame cadence.
//!
//! # Architecture
//!
//! - **Compositor Core**: app/window records, surface commit state machine,
//!   scene graph, buffer release contract, per-output frame scheduling
//! - **Input**: seat with shared modifier/LED state and hit-tested pointer
//!   focus
//! - **Protocol Layer**: wl_shm pool validation and xdg positioner math
//! - **Server**: wayland-server dispatch glued to a calloop event loop
//! - **Renderer**: the compositing backend seam; headless by default
//!
//! # Example
//!
//! ```no_run
//! use nacre::compositor::CompositorState;
//!
//! // The compositor is typically run via the main binary
//! // See src/main.rs for the entry point
//! let state = CompositorState::new();
//! assert!(state.apps.is_empty());
//! ```

pub mod compositor;
pub mod input;
pub mod protocol;
pub mod renderer;
pub mod server;
