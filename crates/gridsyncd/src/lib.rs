//! Offline driver for the synchronizer.
//!
//! [`replay`] feeds a recorded JSON-lines stream of observation events
//! through a worker and returns the final tree; [`render`] prints it.

pub mod render;
pub mod replay;

pub use render::render_tree;
pub use replay::{parse_events, replay, Malformed, ReplayReport};
