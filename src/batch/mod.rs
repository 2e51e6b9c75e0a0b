//! Batch windows and the scheduler that owns them.
//!
//! Per stream key the lifecycle is `ABSENT -> ACCUMULATING -> FLUSHING -> ABSENT`.
//! A window is created by the first detection for an idle key, flushed once
//! (deadline, size guard, explicit flush or shutdown) and never resurrected.

mod scheduler;
mod summary;
mod timer;
mod window;

use std::time::Duration;

pub use scheduler::{BatchScheduler, SubmitOutcome};
pub use summary::{BatchSummary, ClassStats, FlushReason};
pub use timer::{FlushTimer, TimerHandle};
pub use window::{AcceptOutcome, BatchWindow};

pub const DEFAULT_WINDOW_SECS: f64 = 10.0;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_TRACK_EXPIRY: u32 = 30;
pub const DEFAULT_IOU_THRESHOLD: f64 = 0.3;

/// Engine tunables. Validation and fallback happen in `config`.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchConfig {
    /// Fixed window length from creation; not extended by later detections.
    pub window: Duration,
    /// Early flush once a window holds more than this many detections.
    pub max_batch_size: usize,
    /// Frames a track may go unmatched before it is dropped.
    pub track_expiry: u32,
    pub iou_threshold: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs_f64(DEFAULT_WINDOW_SECS),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            track_expiry: DEFAULT_TRACK_EXPIRY,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        }
    }
}
