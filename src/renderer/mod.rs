//! Render backend seam
//!
//! The compositor core never paints pixels itself; it hands the z-ordered
//! composite list for one output to whatever implements [`RenderBackend`].
//! The headless backend records frames instead of painting, which is what
//! the binary runs against and what the tests observe.

pub mod headless;

pub use headless::HeadlessBackend;

use crate::compositor::output::Output;
use crate::compositor::scene::CompositeElement;

/// Errors from the render backend
///
/// Losing the backend is infrastructure loss: the server logs it and exits
/// non-zero, per the fatal-path policy.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("render backend lost: {0}")]
    BackendLost(String),
    #[error("composite failed: {0}")]
    CompositeFailed(String),
}

/// The painting collaborator the compositor drives
pub trait RenderBackend {
    /// Composite the ordered element list onto one output
    ///
    /// Called at most once per output between two frame-done signals.
    fn composite(
        &mut self,
        output: &Output,
        elements: &[CompositeElement],
    ) -> Result<(), RenderError>;
}
