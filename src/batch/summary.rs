use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::StreamKey;

/// Why a window was flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    Deadline,
    SizeGuard,
    Manual,
    Shutdown,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlushReason::Deadline => "deadline",
            FlushReason::SizeGuard => "size_guard",
            FlushReason::Manual => "manual",
            FlushReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Confidence statistics for one object class.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClassStats {
    pub count: u64,
    pub avg_confidence: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
}

/// Immutable result of one flushed window.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchSummary {
    pub stream_key: StreamKey,
    pub window_start_ms: u64,
    pub window_end_ms: u64,
    /// Every detection the window accepted, malformed ones included.
    pub total_detections: u64,
    /// Malformed detections counted above but kept out of tracking.
    pub skipped_detections: u64,
    /// Distinct tracks created in the window, expired ones included.
    pub unique_track_count: u64,
    /// Most tracks seen together in a single frame.
    pub peak_occupancy: u64,
    pub frames: u64,
    pub classes: BTreeMap<String, ClassStats>,
    pub detections_per_second: f64,
    pub reason: FlushReason,
}

impl BatchSummary {
    pub fn duration_secs(&self) -> f64 {
        self.window_end_ms.saturating_sub(self.window_start_ms) as f64 / 1000.0
    }

    /// Short title line for chat notifications.
    pub fn title(&self) -> String {
        format!(
            "Detection summary: {} ({})",
            self.stream_key.stream, self.stream_key.app
        )
    }

    /// One line per class, ordered by class name.
    pub fn class_lines(&self) -> Vec<String> {
        self.classes
            .iter()
            .map(|(class, stats)| {
                format!(
                    "{}: {} seen, confidence {:.2}-{:.2} (avg {:.2})",
                    class,
                    stats.count,
                    stats.min_confidence,
                    stats.max_confidence,
                    stats.avg_confidence
                )
            })
            .collect()
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let objects = if self.unique_track_count == 1 {
            "object"
        } else {
            "objects"
        };
        write!(
            f,
            "{}: {} detections, {} unique {}, peak {} in view over {:.1}s ({:.2}/s)",
            self.stream_key,
            self.total_detections,
            self.unique_track_count,
            objects,
            self.peak_occupancy,
            self.duration_secs(),
            self.detections_per_second
        )?;
        for line in self.class_lines() {
            write!(f, "; {}", line)?;
        }
        if self.skipped_detections > 0 {
            write!(f, "; {} malformed skipped", self.skipped_detections)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> BatchSummary {
        let mut classes = BTreeMap::new();
        classes.insert(
            "person".to_string(),
            ClassStats {
                count: 3,
                avg_confidence: 0.91,
                min_confidence: 0.88,
                max_confidence: 0.95,
            },
        );
        BatchSummary {
            stream_key: StreamKey::new("live", "lobby", "_defaultVHost_"),
            window_start_ms: 1_000,
            window_end_ms: 11_000,
            total_detections: 3,
            skipped_detections: 0,
            unique_track_count: 1,
            peak_occupancy: 1,
            frames: 3,
            classes,
            detections_per_second: 0.3,
            reason: FlushReason::Deadline,
        }
    }

    #[test]
    fn display_reads_as_one_line() {
        let text = summary().to_string();
        assert_eq!(
            text,
            "live/lobby@_defaultVHost_: 3 detections, 1 unique object, peak 1 in view over 10.0s (0.30/s); \
             person: 3 seen, confidence 0.88-0.95 (avg 0.91)"
        );
    }

    #[test]
    fn serializes_reason_as_snake_case() {
        let value = serde_json::to_value(summary()).unwrap();
        assert_eq!(value["reason"], "deadline");
        assert_eq!(value["stream_key"]["stream"], "lobby");
        assert_eq!(value["classes"]["person"]["count"], 3);
    }
}
