//! Stream Digest
//!
//! This crate turns a firehose of per-frame object detections into periodic,
//! human-readable summaries instead of one notification per detection.
//!
//! # Architecture
//!
//! Detections are grouped per stream key into fixed batch windows. Inside a
//! window, raw detections are deduplicated into tracks by greedy IoU matching
//! so a person standing in front of a camera for ten seconds is reported as
//! one object, not three hundred.
//!
//! # Module Structure
//!
//! - `overlap`: Intersection-over-union of two boxes
//! - `track`: Track table and per-frame greedy matcher
//! - `batch`: Batch windows, summaries and the scheduler that owns timing
//! - `sink`: Outbound summary delivery seam
//! - `transport`: Webhook payload parsing
//! - `api`: Minimal HTTP listener for webhook ingestion
//! - `config`: File + environment configuration
//! - Core types: StreamKey, BoundingBox, Detection

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod batch;
pub mod config;
pub mod overlap;
pub mod sink;
pub mod track;
pub mod transport;

pub use batch::{
    AcceptOutcome, BatchConfig, BatchScheduler, BatchSummary, BatchWindow, ClassStats,
    FlushReason, SubmitOutcome,
};
pub use overlap::iou;
pub use sink::{ChannelSink, CollectingSink, LogSink, SummarySink};
#[cfg(feature = "slack")]
pub use sink::SlackSink;
pub use track::{FrameMatcher, FrameOutcome, Track, TrackTable};

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// -------------------- Stream Keys --------------------

/// Identifies one video source. Tracking and batching state never crosses keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub app: String,
    pub stream: String,
    pub vhost: String,
}

impl StreamKey {
    pub fn new(app: impl Into<String>, stream: impl Into<String>, vhost: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            stream: stream.into(),
            vhost: vhost.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.app, self.stream, self.vhost)
    }
}

// -------------------- Bounding Boxes --------------------

/// Axis-aligned box in corner form. Every inbound format is normalized to this.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_origin_size(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x1: x,
            y1: y,
            x2: x + width,
            y2: y + height,
        }
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }

    /// True for zero/negative extents and any non-finite coordinate.
    pub fn is_degenerate(&self) -> bool {
        let finite = [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite());
        // `!(x > 0.0)` also rejects NaN extents.
        !finite || !(self.width() > 0.0) || !(self.height() > 0.0)
    }

    /// Area of a well-formed box; 0.0 for degenerate input.
    pub fn area(&self) -> f64 {
        if self.is_degenerate() {
            return 0.0;
        }
        self.width() * self.height()
    }
}

/// Bounding box as it arrives from a producer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BoxFormat {
    /// `[x1, y1, x2, y2]`
    Corners([f64; 4]),
    /// `[x, y, width, height]`
    OriginSize([f64; 4]),
}

impl BoxFormat {
    pub fn normalize(self) -> BoundingBox {
        match self {
            BoxFormat::Corners([x1, y1, x2, y2]) => BoundingBox::from_corners(x1, y1, x2, y2),
            BoxFormat::OriginSize([x, y, w, h]) => BoundingBox::from_origin_size(x, y, w, h),
        }
    }
}

impl From<BoxFormat> for BoundingBox {
    fn from(format: BoxFormat) -> Self {
        format.normalize()
    }
}

// -------------------- Detections --------------------

/// One observation of one object in one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub stream_key: StreamKey,
    pub class: String,
    pub bbox: BoundingBox,
    /// Expected in [0, 1] but not trusted.
    pub confidence: f64,
    /// Frame instant in epoch milliseconds. Detections sharing it form one frame.
    pub frame_ts_ms: u64,
}

impl Detection {
    pub fn new(
        stream_key: StreamKey,
        class: impl Into<String>,
        bbox: impl Into<BoundingBox>,
        confidence: f64,
        frame_ts_ms: u64,
    ) -> Self {
        Self {
            stream_key,
            class: class.into(),
            bbox: bbox.into(),
            confidence,
            frame_ts_ms,
        }
    }

    /// Checks whether this detection may take part in tracking.
    pub fn validate(&self) -> Result<()> {
        if self.class.trim().is_empty() {
            return Err(anyhow!("missing class"));
        }
        if !self.confidence.is_finite() {
            return Err(anyhow!("non-finite confidence {}", self.confidence));
        }
        if self.bbox.is_degenerate() {
            return Err(anyhow!(
                "degenerate bbox [{}, {}, {}, {}]",
                self.bbox.x1,
                self.bbox.y1,
                self.bbox.x2,
                self.bbox.y2
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> StreamKey {
        StreamKey::new("live", "lobby", "_defaultVHost_")
    }

    #[test]
    fn origin_size_normalizes_to_corners() {
        let bbox: BoundingBox = BoxFormat::OriginSize([10.0, 20.0, 30.0, 40.0]).into();
        assert_eq!(bbox, BoundingBox::from_corners(10.0, 20.0, 40.0, 60.0));
        assert_eq!(bbox.area(), 1200.0);
    }

    #[test]
    fn degenerate_boxes_are_flagged() {
        assert!(BoundingBox::from_corners(0.0, 0.0, 0.0, 5.0).is_degenerate());
        assert!(BoundingBox::from_corners(0.0, 5.0, 5.0, 0.0).is_degenerate());
        assert!(BoundingBox::from_corners(f64::NAN, 0.0, 5.0, 5.0).is_degenerate());
        assert!(BoundingBox::from_corners(0.0, 0.0, f64::INFINITY, 5.0).is_degenerate());
        assert!(!BoundingBox::from_corners(0.0, 0.0, 1.0, 1.0).is_degenerate());
    }

    #[test]
    fn validate_rejects_bad_confidence_and_boxes() {
        let good = Detection::new(
            key(),
            "person",
            BoxFormat::Corners([0.0, 0.0, 1.0, 1.0]),
            0.9,
            1,
        );
        assert!(good.validate().is_ok());

        let mut nan_conf = good.clone();
        nan_conf.confidence = f64::NAN;
        assert!(nan_conf
            .validate()
            .unwrap_err()
            .to_string()
            .contains("non-finite confidence"));

        let mut flat = good.clone();
        flat.bbox = BoundingBox::from_corners(0.0, 0.0, 1.0, 0.0);
        assert!(flat.validate().unwrap_err().to_string().contains("degenerate"));

        let mut unnamed = good;
        unnamed.class = "  ".to_string();
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn stream_key_display_is_compact() {
        assert_eq!(key().to_string(), "live/lobby@_defaultVHost_");
    }
}
