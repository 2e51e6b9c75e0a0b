//! Multi-frame object tracking.
//!
//! A `TrackTable` holds the live track hypotheses of one batch window; the
//! `FrameMatcher` feeds one frame of detections through it. Tables are
//! window-scoped: they are dropped wholesale at flush, so track ids are only
//! unique within a single window.

mod matcher;
mod table;

pub use matcher::{FrameMatcher, FrameOutcome};
pub use table::{Track, TrackTable};
