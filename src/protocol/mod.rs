//! Wire-protocol state shared with the dispatch layer
//!
//! - xdg-shell positioner math
//! - wl_shm pool and buffer validation

pub mod shell;
pub mod shm;

pub use shell::{Anchor, Gravity, Positioner};
pub use shm::{ShmError, ShmPoolId, ShmState};
