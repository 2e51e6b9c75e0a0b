use std::collections::BTreeMap;

use crate::track::{FrameMatcher, TrackTable};
use crate::{Detection, StreamKey};

use super::summary::{BatchSummary, ClassStats, FlushReason};
use super::BatchConfig;

/// Result of handing one detection to a window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Counted and queued for tracking.
    Accepted,
    /// Counted but malformed; kept out of tracking.
    Skipped,
    /// Counted, and the window is now over its size limit. Flush it.
    FlushNow,
    /// Belongs to another stream; not counted.
    Rejected,
}

#[derive(Debug)]
struct ClassAccumulator {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl ClassAccumulator {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn record(&mut self, confidence: f64) {
        self.count += 1;
        self.sum += confidence;
        self.min = self.min.min(confidence);
        self.max = self.max.max(confidence);
    }

    fn stats(&self) -> ClassStats {
        ClassStats {
            count: self.count,
            avg_confidence: self.sum / self.count as f64,
            min_confidence: self.min,
            max_confidence: self.max,
        }
    }
}

/// Accumulated activity of one stream between two flushes.
///
/// Valid detections are buffered per frame timestamp, whatever order they
/// arrive in, and matched against a fresh track table frame by frame in
/// timestamp order at summarize. The buffer is bounded by the size guard.
#[derive(Debug)]
pub struct BatchWindow {
    stream_key: StreamKey,
    window_start_ms: u64,
    max_batch_size: usize,
    iou_threshold: f64,
    track_expiry: u32,
    frames: BTreeMap<u64, Vec<Detection>>,
    total: u64,
    skipped: u64,
    classes: BTreeMap<String, ClassAccumulator>,
}

impl BatchWindow {
    pub fn new(stream_key: StreamKey, window_start_ms: u64, config: &BatchConfig) -> Self {
        Self {
            stream_key,
            window_start_ms,
            max_batch_size: config.max_batch_size,
            iou_threshold: config.iou_threshold,
            track_expiry: config.track_expiry,
            frames: BTreeMap::new(),
            total: 0,
            skipped: 0,
            classes: BTreeMap::new(),
        }
    }

    pub fn total_detections(&self) -> u64 {
        self.total
    }

    /// Distinct frame timestamps buffered so far.
    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn accept(&mut self, detection: Detection) -> AcceptOutcome {
        if detection.stream_key != self.stream_key {
            log::warn!(
                "detection for {} offered to window of {}; ignoring",
                detection.stream_key,
                self.stream_key
            );
            return AcceptOutcome::Rejected;
        }

        self.total += 1;
        let outcome = match detection.validate() {
            Err(e) => {
                log::warn!(
                    "skipping malformed detection on {} (class '{}'): {}",
                    self.stream_key,
                    detection.class,
                    e
                );
                self.skipped += 1;
                AcceptOutcome::Skipped
            }
            Ok(()) => {
                let confidence = detection.confidence.clamp(0.0, 1.0);
                self.classes
                    .entry(detection.class.clone())
                    .or_insert_with(ClassAccumulator::new)
                    .record(confidence);
                self.frames
                    .entry(detection.frame_ts_ms)
                    .or_default()
                    .push(detection);
                AcceptOutcome::Accepted
            }
        };

        if self.total > self.max_batch_size as u64 {
            return AcceptOutcome::FlushNow;
        }
        outcome
    }

    /// Closes the window and produces its summary.
    pub fn summarize(self, window_end_ms: u64, reason: FlushReason) -> BatchSummary {
        let matcher = FrameMatcher::new(self.iou_threshold);
        let mut tracks = TrackTable::new(self.track_expiry);
        let mut peak_occupancy = 0usize;
        for (ts, frame) in &self.frames {
            let refs: Vec<&Detection> = frame.iter().collect();
            let outcome = matcher.apply(&mut tracks, *ts, &refs);
            peak_occupancy = peak_occupancy.max(outcome.occupancy);
        }

        let elapsed_ms = window_end_ms.saturating_sub(self.window_start_ms);
        let detections_per_second = if elapsed_ms == 0 {
            0.0
        } else {
            self.total as f64 / (elapsed_ms as f64 / 1000.0)
        };

        BatchSummary {
            stream_key: self.stream_key,
            window_start_ms: self.window_start_ms,
            window_end_ms: window_end_ms.max(self.window_start_ms),
            total_detections: self.total,
            skipped_detections: self.skipped,
            unique_track_count: tracks.created_count(),
            peak_occupancy: peak_occupancy as u64,
            frames: self.frames.len() as u64,
            classes: self
                .classes
                .iter()
                .map(|(class, acc)| (class.clone(), acc.stats()))
                .collect(),
            detections_per_second,
            reason,
        }
    }
}
