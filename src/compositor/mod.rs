//! Compositor core module
//!
//! This module contains the core compositor logic including:
//! - Global compositor state and the commit/ack pipeline
//! - Surface lifecycle and double-buffered state
//! - Application and window records
//! - Buffer ownership and the release contract
//! - Output records, damage tracking, and frame pacing
//! - The scene graph used for compositing and hit testing

pub mod app;
pub mod buffer;
pub mod geometry;
pub mod output;
pub mod scene;
pub mod state;
pub mod surface;
pub mod window;

pub use app::{AppIcon, AppId, AppRecord, AppRegistry, ConnectionId};
pub use buffer::{Allocator, Buffer, BufferId, BufferManager, PixelFormat};
pub use geometry::{Rect, Region};
pub use output::{Output, OutputId, OutputManager, OutputMode};
pub use scene::{CompositeElement, Scene, SceneElement};
pub use state::{CompositorState, ServerEvent};
pub use surface::{MapState, Surface, SurfaceId, SurfaceManager, SurfaceRole};
pub use window::{WindowId, WindowRecord, WindowStateFlags};
