//! Headless render backend
//!
//! Records every composite call instead of painting. Used by the binary
//! when no GPU backend is attached, and by tests to observe frame pacing.

use log::debug;

use crate::compositor::output::{Output, OutputId};
use crate::compositor::scene::CompositeElement;

use super::{RenderBackend, RenderError};

/// One recorded frame
#[derive(Debug, Clone)]
pub struct RecordedFrame {
    pub output: OutputId,
    pub elements: Vec<CompositeElement>,
}

/// Backend that records frames instead of presenting them
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    frames: Vec<RecordedFrame>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total composite calls observed
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn last_frame(&self) -> Option<&RecordedFrame> {
        self.frames.last()
    }

    pub fn frames(&self) -> &[RecordedFrame] {
        &self.frames
    }
}

impl RenderBackend for HeadlessBackend {
    fn composite(
        &mut self,
        output: &Output,
        elements: &[CompositeElement],
    ) -> Result<(), RenderError> {
        debug!(
            "Headless composite on {} ({} element(s))",
            output.name,
            elements.len()
        );
        self.frames.push(RecordedFrame {
            output: output.id,
            elements: elements.to_vec(),
        });
        Ok(())
    }
}
